use crate::coordinator::DEFAULT_CLEANUP_TIMEOUT;
use crate::registry::DEFAULT_ACTION_TIMEOUT;
use crate::signals::EscalationPolicy;
use crate::transfer::TransferOptions;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from tidyexit.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub shutdown: ShutdownConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Total budget for all cleanup actions.
    pub cleanup_timeout_secs: u64,
    /// Per-action timeout for the built-in cleanup actions.
    pub action_timeout_secs: u64,
    pub rapid_window_ms: u64,
    pub force_threshold: u32,
    pub stop_file: PathBuf,
    pub stop_file_poll_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub output_dir: PathBuf,
    pub chunk_size: usize,
    /// Pause after each chunk, in milliseconds.
    pub throttle_ms: u64,
}

// --- Default implementations ---

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            cleanup_timeout_secs: DEFAULT_CLEANUP_TIMEOUT.as_secs(),
            action_timeout_secs: DEFAULT_ACTION_TIMEOUT.as_secs(),
            rapid_window_ms: 2000,
            force_threshold: 2,
            stop_file: PathBuf::from("STOP"),
            stop_file_poll_ms: 500,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            chunk_size: 8192,
            throttle_ms: 0,
        }
    }
}

impl ShutdownConfig {
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn stop_file_poll(&self) -> Duration {
        Duration::from_millis(self.stop_file_poll_ms)
    }

    pub fn escalation_policy(&self) -> EscalationPolicy {
        EscalationPolicy {
            rapid_window: Duration::from_millis(self.rapid_window_ms),
            force_threshold: self.force_threshold,
        }
    }
}

impl TransferConfig {
    pub fn options(&self) -> TransferOptions {
        TransferOptions {
            chunk_size: self.chunk_size,
            throttle: Duration::from_millis(self.throttle_ms),
        }
    }
}

impl Config {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let config = Self::parse(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Parse and validate config text.
    pub fn parse(contents: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shutdown.cleanup_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "shutdown.cleanup_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.shutdown.action_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "shutdown.action_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.shutdown.force_threshold == 0 {
            return Err(ConfigError::Invalid(
                "shutdown.force_threshold must be at least 1".to_string(),
            ));
        }
        if self.shutdown.stop_file_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "shutdown.stop_file_poll_ms must be greater than 0".to_string(),
            ));
        }
        if self.transfer.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "transfer.chunk_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Errors from loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}
