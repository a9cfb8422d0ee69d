use crate::registry::CleanupAction;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// File name of the lock claimed inside the output directory.
pub const LOCK_FILE_NAME: &str = ".tidyexit.lock";

const ACQUIRE_ATTEMPTS: usize = 3;

/// Single-instance lock on an output directory.
///
/// Holds an exclusive advisory lock on the lock file, which records the
/// owner's pid for error messages. The kernel drops the lock when the owning
/// process dies, so a file left behind by a killed run does not block the
/// next one.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: File,
}

impl LockFile {
    /// Claim the lock at `path`.
    pub fn acquire(path: &Path) -> Result<LockFile, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        for _ in 0..ACQUIRE_ATTEMPTS {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map_err(io_err)?;

            if let Err(e) = file.try_lock_exclusive() {
                if e.kind() == fs2::lock_contended_error().kind() {
                    return Err(LockError::Held {
                        path: path.to_path_buf(),
                        pid: read_pid(path),
                    });
                }
                return Err(io_err(e));
            }

            // The previous owner may have unlinked the file between our open
            // and lock; then we hold a lock nobody else can see
            let same_file = match std::fs::metadata(path) {
                Ok(on_disk) => {
                    let held = file.metadata().map_err(io_err)?;
                    on_disk.dev() == held.dev() && on_disk.ino() == held.ino()
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => return Err(io_err(e)),
            };
            if !same_file {
                continue;
            }

            if let Some(stale) = read_pid(path) {
                tracing::info!(path = %path.display(), pid = stale, "reclaiming stale lock");
            }
            file.set_len(0).map_err(io_err)?;
            file.rewind().map_err(io_err)?;
            writeln!(file, "{}", std::process::id()).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;

            tracing::debug!(path = %path.display(), "lock acquired");
            return Ok(LockFile {
                path: path.to_path_buf(),
                file,
            });
        }

        Err(LockError::Held {
            path: path.to_path_buf(),
            pid: read_pid(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file. A lock that is already gone is not an error.
    /// The advisory lock itself is held until `self` drops.
    pub fn release(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Hand the lock to the coordinator: releasing it becomes a cleanup action.
    pub fn into_cleanup_action(self, name: impl Into<String>) -> CleanupAction {
        CleanupAction::blocking(name, move || {
            self.release()?;
            let _ = self.file.unlock();
            tracing::debug!(path = %self.path.display(), "lock released");
            Ok(())
        })
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Errors from claiming the lock.
#[derive(Debug)]
pub enum LockError {
    /// Another process holds the lock.
    Held { path: PathBuf, pid: Option<u32> },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Held {
                path,
                pid: Some(pid),
            } => write!(f, "{} is held by pid {}", path.display(), pid),
            LockError::Held { path, pid: None } => {
                write!(f, "{} is held by another process", path.display())
            }
            LockError::Io { path, source } => {
                write!(f, "lock file error at {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Held { .. } => None,
            LockError::Io { source, .. } => Some(source),
        }
    }
}
