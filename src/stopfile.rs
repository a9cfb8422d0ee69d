/// STOP file detection.
///
/// Periodically checks for a marker file. When it appears, a graceful
/// shutdown is requested and the marker is consumed so the next run does not
/// stop immediately.
use crate::signals::{ShutdownRequest, TerminationSignal};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc::UnboundedSender, watch};

/// Why the watcher stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopFileOutcome {
    /// The file appeared and a shutdown request was sent.
    Detected,
    /// Shutdown was requested by something else first.
    ShutdownElsewhere,
}

pub struct StopFileWatcher {
    path: PathBuf,
    interval: Duration,
}

impl StopFileWatcher {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
        }
    }

    /// Poll until the STOP file shows up or `shutdown` flips.
    pub async fn watch(
        self,
        requests: UnboundedSender<ShutdownRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) -> StopFileOutcome {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut warned = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match tokio::fs::try_exists(&self.path).await {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(e) => {
                            if !warned {
                                tracing::warn!(
                                    error = %e,
                                    path = %self.path.display(),
                                    "cannot check for stop file"
                                );
                                warned = true;
                            }
                            continue;
                        }
                    }
                    tracing::info!(path = %self.path.display(), "stop file detected");
                    if let Err(e) = tokio::fs::remove_file(&self.path).await {
                        tracing::warn!(
                            error = %e,
                            path = %self.path.display(),
                            "failed to remove stop file"
                        );
                    }
                    let _ = requests.send(ShutdownRequest {
                        signal: TerminationSignal::StopFile,
                        forced: false,
                    });
                    return StopFileOutcome::Detected;
                }
                // The borrow guard from wait_for is not Send; drop it inside the branch
                _ = async { let _ = shutdown.wait_for(|requested| *requested).await; } => {
                    return StopFileOutcome::ShutdownElsewhere;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_detects_stop_file_and_requests_graceful_shutdown() {
        let dir = tempdir().unwrap();
        let stop = dir.path().join("STOP");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_flag_tx, flag_rx) = watch::channel(false);

        let watcher = StopFileWatcher::new(&stop, Duration::from_millis(10));
        let task = tokio::spawn(watcher.watch(tx, flag_rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
        std::fs::write(&stop, "").unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, StopFileOutcome::Detected);
        assert_eq!(
            rx.recv().await.unwrap(),
            ShutdownRequest {
                signal: TerminationSignal::StopFile,
                forced: false
            }
        );
        assert!(!stop.exists());
    }

    #[tokio::test]
    async fn test_exits_when_shutdown_requested_elsewhere() {
        let dir = tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (flag_tx, flag_rx) = watch::channel(false);

        let watcher = StopFileWatcher::new(dir.path().join("STOP"), Duration::from_millis(10));
        let task = tokio::spawn(watcher.watch(tx, flag_rx));
        flag_tx.send_replace(true);

        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, StopFileOutcome::ShutdownElsewhere);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_watch_future_is_spawnable_on_multi_thread_runtime() {
        fn assert_send<T: Send>(_: &T) {}
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_flag_tx, flag_rx) = watch::channel(false);
        let fut = StopFileWatcher::new("STOP", Duration::from_millis(10)).watch(tx, flag_rx);
        assert_send(&fut);
    }

    #[tokio::test]
    async fn test_unreadable_location_keeps_watching_until_shutdown() {
        let dir = tempdir().unwrap();
        // A regular file used as a directory component makes the check error out
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (flag_tx, flag_rx) = watch::channel(false);

        let watcher = StopFileWatcher::new(blocker.join("STOP"), Duration::from_millis(5));
        let task = tokio::spawn(watcher.watch(tx, flag_rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!task.is_finished());

        flag_tx.send_replace(true);
        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, StopFileOutcome::ShutdownElsewhere);
        assert!(rx.recv().await.is_none());
    }
}
