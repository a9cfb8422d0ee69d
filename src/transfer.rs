//! Chunked transfers that cooperate with shutdown.
//!
//! A transfer writes into a hidden temporary file next to its destination and
//! only moves it into place, without overwriting anything, once the source is
//! exhausted. It checks the shutdown probe at every chunk boundary. When
//! shutdown has been requested it stops reading, deletes the temporary file and
//! reports [`TransferOutcome::Cancelled`]. Nothing preempts a transfer that is
//! blocked inside a read; the coordinator's aggregate timeout is the only
//! backstop for that. Dropping such a transfer still removes its temporary file.

use crate::coordinator::ShutdownProbe;
use crate::registry::CleanupAction;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

/// How a transfer ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { bytes: u64 },
    /// Shutdown was requested; the partial output was removed.
    Cancelled { bytes_discarded: u64 },
}

/// Errors from a transfer. The partial output is removed before returning.
#[derive(Debug)]
pub enum TransferError {
    /// Failed to open the source.
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The destination already exists; transfers never overwrite.
    Exists { path: PathBuf },
    /// Failed to create the destination file.
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed while reading the source.
    Read { source: std::io::Error },
    /// Failed while writing the destination.
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Open { path, source } => {
                write!(f, "failed to open {}: {}", path.display(), source)
            }
            TransferError::Exists { path } => {
                write!(f, "refusing to overwrite {}", path.display())
            }
            TransferError::Create { path, source } => {
                write!(f, "failed to create {}: {}", path.display(), source)
            }
            TransferError::Read { source } => write!(f, "read error during transfer: {}", source),
            TransferError::Write { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::Open { source, .. } => Some(source),
            TransferError::Exists { .. } => None,
            TransferError::Create { source, .. } => Some(source),
            TransferError::Read { source } => Some(source),
            TransferError::Write { source, .. } => Some(source),
        }
    }
}

/// Chunking knobs for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub chunk_size: usize,
    /// Pause after every chunk. Zero disables throttling.
    pub throttle: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: 8192,
            throttle: Duration::ZERO,
        }
    }
}

fn discard_partial(partial: TempPath) {
    let path = partial.to_path_buf();
    match partial.close() {
        Ok(()) => tracing::debug!(path = %path.display(), "removed partial output"),
        Err(e) => tracing::warn!(
            error = %e,
            path = %path.display(),
            "failed to remove partial output"
        ),
    }
}

fn already_exists(dest: &Path) -> bool {
    std::fs::symlink_metadata(dest).is_ok()
}

/// Copy `reader` into a new file at `dest`, one chunk at a time, polling
/// `probe` before each chunk. An existing `dest` is never touched.
pub async fn copy_with_shutdown<R, P>(
    reader: &mut R,
    dest: &Path,
    options: &TransferOptions,
    probe: &P,
) -> Result<TransferOutcome, TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
    P: ShutdownProbe + ?Sized,
{
    if already_exists(dest) {
        return Err(TransferError::Exists {
            path: dest.to_path_buf(),
        });
    }

    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let create_err = |e| TransferError::Create {
        path: dest.to_path_buf(),
        source: e,
    };
    let (std_file, partial) = tempfile::Builder::new()
        .prefix(".tidyexit-")
        .suffix(".part")
        .tempfile_in(dir)
        .map_err(create_err)?
        .into_parts();
    let mut file = tokio::fs::File::from_std(std_file);

    let mut buf = vec![0u8; options.chunk_size.max(1)];
    let mut written: u64 = 0;

    loop {
        if probe.is_shutdown_requested() {
            drop(file);
            discard_partial(partial);
            tracing::info!(
                path = %dest.display(),
                bytes_discarded = written,
                "transfer cancelled by shutdown"
            );
            return Ok(TransferOutcome::Cancelled {
                bytes_discarded: written,
            });
        }

        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                drop(file);
                discard_partial(partial);
                return Err(TransferError::Read { source: e });
            }
        };

        if let Err(e) = file.write_all(&buf[..n]).await {
            drop(file);
            discard_partial(partial);
            return Err(TransferError::Write {
                path: dest.to_path_buf(),
                source: e,
            });
        }
        written += n as u64;

        if !options.throttle.is_zero() {
            tokio::time::sleep(options.throttle).await;
        }
    }

    if let Err(e) = file.flush().await {
        drop(file);
        discard_partial(partial);
        return Err(TransferError::Write {
            path: dest.to_path_buf(),
            source: e,
        });
    }
    drop(file);

    // Something may have claimed the name while we were copying
    if let Err(e) = partial.persist_noclobber(dest) {
        let err = if e.error.kind() == std::io::ErrorKind::AlreadyExists {
            TransferError::Exists {
                path: dest.to_path_buf(),
            }
        } else {
            TransferError::Write {
                path: dest.to_path_buf(),
                source: e.error,
            }
        };
        discard_partial(e.path);
        return Err(err);
    }

    Ok(TransferOutcome::Completed { bytes: written })
}

/// Counts in-flight transfers so shutdown can wait for them to settle.
#[derive(Debug, Clone)]
pub struct TransferTracker {
    active: Arc<watch::Sender<usize>>,
}

impl Default for TransferTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferTracker {
    pub fn new() -> Self {
        let (active, _) = watch::channel(0);
        Self {
            active: Arc::new(active),
        }
    }

    /// Mark a transfer as started. It counts as in flight until the guard drops.
    pub fn begin(&self) -> TransferGuard {
        self.active.send_modify(|n| *n += 1);
        TransferGuard {
            active: Arc::clone(&self.active),
        }
    }

    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Resolve once no transfer is in flight.
    pub async fn drain(&self) {
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// A cleanup action that waits for in-flight transfers to roll back.
    pub fn cleanup_action(&self, name: impl Into<String>) -> CleanupAction {
        let tracker = self.clone();
        CleanupAction::new(name, move || async move {
            let pending = tracker.active();
            if pending > 0 {
                tracing::info!(pending, "waiting for in-flight transfers to stop");
            }
            tracker.drain().await;
            Ok(())
        })
    }
}

/// Keeps a transfer counted as in flight.
#[derive(Debug)]
pub struct TransferGuard {
    active: Arc<watch::Sender<usize>>,
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Where a transfer reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Stdin,
    File(PathBuf),
}

impl Source {
    /// `-` means stdin; anything else is a path.
    pub fn parse(arg: &str) -> Self {
        if arg == "-" {
            Source::Stdin
        } else {
            Source::File(PathBuf::from(arg))
        }
    }

    /// File name used for the copy in the output directory.
    pub fn file_name(&self) -> String {
        match self {
            Source::Stdin => "stdin".to_string(),
            Source::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unnamed".to_string()),
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Stdin => f.write_str("<stdin>"),
            Source::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Copies sources into an output directory, tracked and shutdown-aware.
pub struct Downloader {
    output_dir: PathBuf,
    options: TransferOptions,
    tracker: TransferTracker,
    probe: Arc<dyn ShutdownProbe>,
}

impl Downloader {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        options: TransferOptions,
        probe: Arc<dyn ShutdownProbe>,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            options,
            tracker: TransferTracker::new(),
            probe,
        }
    }

    pub fn tracker(&self) -> &TransferTracker {
        &self.tracker
    }

    /// Copy one source into the output directory.
    pub async fn fetch(&self, source: &Source) -> Result<TransferOutcome, TransferError> {
        let _in_flight = self.tracker.begin();
        let dest = self.output_dir.join(source.file_name());
        tracing::info!(source = %source, dest = %dest.display(), "transfer started");

        let outcome = match source {
            Source::Stdin => {
                let mut stdin = tokio::io::stdin();
                copy_with_shutdown(&mut stdin, &dest, &self.options, self.probe.as_ref()).await?
            }
            Source::File(path) => {
                let mut file =
                    tokio::fs::File::open(path)
                        .await
                        .map_err(|e| TransferError::Open {
                            path: path.clone(),
                            source: e,
                        })?;
                copy_with_shutdown(&mut file, &dest, &self.options, self.probe.as_ref()).await?
            }
        };

        if let TransferOutcome::Completed { bytes } = outcome {
            tracing::info!(source = %source, bytes, "transfer complete");
        }
        Ok(outcome)
    }
}
