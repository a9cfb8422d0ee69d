/// Shutdown coordinator: the `Idle -> ShuttingDown -> Done` state machine.
///
/// Owns the cleanup registry, exposes the shutdown-requested flag and signal,
/// and runs every registered action concurrently under per-action and
/// aggregate timeouts exactly once per process.
use crate::registry::{CleanupAction, CleanupRegistry, RegistrationError};
use crate::report::{ActionOutcome, ActionReport, ShutdownReport};
use crate::signals::{ShutdownRequest, TerminationSignal};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default aggregate cleanup budget.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

const IDLE: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const DONE: u8 = 2;

/// Lifecycle of the coordinator. There is no way back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    ShuttingDown,
    Done,
}

/// Immutable record of the request that started the shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownContext {
    pub signal: TerminationSignal,
    pub requested_at: DateTime<Utc>,
    pub forced: bool,
    pub cleanup_timeout: Duration,
    /// What the program reported it was doing when the request arrived.
    pub operation: String,
}

/// What a call to [`ShutdownCoordinator::request`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// This call started the shutdown.
    Started,
    /// Shutdown was already under way; nothing changed.
    Ignored,
    /// A forced request arrived during a graceful shutdown. Logged only.
    EscalationIgnored,
}

/// Anything a long-running loop can poll for a pending shutdown.
pub trait ShutdownProbe: Send + Sync {
    fn is_shutdown_requested(&self) -> bool;
}

/// Coordinates graceful shutdown. Share it as `Arc<ShutdownCoordinator>`.
pub struct ShutdownCoordinator {
    state: AtomicU8,
    // Guards the Idle -> ShuttingDown transition as well as registration
    registry: Mutex<CleanupRegistry>,
    context: OnceLock<ShutdownContext>,
    cleanup_timeout: Duration,
    operation: Mutex<String>,
    requested: watch::Sender<bool>,
    report: watch::Sender<Option<Arc<ShutdownReport>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ShutdownCoordinator {
    /// Create a coordinator whose shutdowns get `cleanup_timeout` in total.
    pub fn new(cleanup_timeout: Duration) -> Self {
        let (requested, _) = watch::channel(false);
        let (report, _) = watch::channel(None);
        Self {
            state: AtomicU8::new(IDLE),
            registry: Mutex::new(CleanupRegistry::new()),
            context: OnceLock::new(),
            cleanup_timeout,
            operation: Mutex::new("idle".to_string()),
            requested,
            report,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        match self.state.load(Ordering::Acquire) {
            IDLE => CoordinatorState::Idle,
            SHUTTING_DOWN => CoordinatorState::ShuttingDown,
            _ => CoordinatorState::Done,
        }
    }

    /// Non-blocking check, safe to call from any task or thread.
    pub fn is_shutdown_requested(&self) -> bool {
        self.state.load(Ordering::Acquire) != IDLE
    }

    /// Context of the current shutdown, once one has started.
    #[allow(dead_code)]
    pub fn context(&self) -> Option<&ShutdownContext> {
        self.context.get()
    }

    /// Record what the program is currently doing, for the shutdown notice.
    pub fn set_current_operation(&self, operation: impl Into<String>) {
        let operation = operation.into();
        tracing::debug!(operation = %operation, "operation state changed");
        *lock(&self.operation) = operation;
    }

    pub fn current_operation(&self) -> String {
        lock(&self.operation).clone()
    }

    /// Register a cleanup action.
    ///
    /// Rejected (and logged) when the name is taken or shutdown has started.
    pub fn register_cleanup(&self, action: CleanupAction) -> Result<(), RegistrationError> {
        let mut registry = lock(&self.registry);
        let result = if self.is_shutdown_requested() {
            Err(RegistrationError::ShutdownInProgress {
                name: action.name().to_string(),
            })
        } else {
            let (name, priority, timeout) = (
                action.name().to_string(),
                action.priority_value(),
                action.timeout_value(),
            );
            registry.register(action).map(|()| {
                tracing::debug!(
                    action = %name,
                    priority,
                    timeout_ms = timeout.as_millis() as u64,
                    "registered cleanup action"
                );
            })
        };
        if let Err(e) = &result {
            tracing::warn!(error = %e, "cleanup registration rejected");
        }
        result
    }

    /// A receiver that flips to `true` once, when shutdown is first requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.requested.subscribe()
    }

    /// Wait until shutdown is requested. Returns immediately if it already was.
    #[allow(dead_code)]
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.requested.subscribe();
        // `self` owns the sender, so the channel cannot close while we wait
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Wait until cleanup has finished and return its report.
    pub async fn wait_for_completion(&self) -> Arc<ShutdownReport> {
        let mut rx = self.report.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(report) = current {
                return report;
            }
            let _ = rx.changed().await;
        }
    }

    /// Request shutdown. Idempotent: only the first call has an effect.
    ///
    /// The first call builds the [`ShutdownContext`], wakes every waiter and
    /// spawns the cleanup protocol; it never blocks. Must be called from
    /// within a tokio runtime.
    pub fn request(self: &Arc<Self>, signal: TerminationSignal, forced: bool) -> RequestOutcome {
        let (context, actions) = {
            let mut registry = lock(&self.registry);
            if self.is_shutdown_requested() {
                drop(registry);
                return self.repeated_request(signal, forced);
            }
            let context = ShutdownContext {
                signal,
                requested_at: Utc::now(),
                forced,
                cleanup_timeout: self.cleanup_timeout,
                operation: self.current_operation(),
            };
            let context = self.context.get_or_init(|| context).clone();
            self.state.store(SHUTTING_DOWN, Ordering::Release);
            (context, std::mem::take(&mut *registry))
        };

        self.requested.send_replace(true);

        if context.forced {
            tracing::warn!(
                signal = %signal,
                operation = %context.operation,
                actions = actions.len(),
                "forced shutdown initiated"
            );
        } else {
            tracing::info!(
                signal = %signal,
                operation = %context.operation,
                actions = actions.len(),
                "graceful shutdown requested"
            );
        }

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.cleanup(context, actions).await;
        });
        RequestOutcome::Started
    }

    fn repeated_request(&self, signal: TerminationSignal, forced: bool) -> RequestOutcome {
        let original_forced = self.context.get().is_some_and(|c| c.forced);
        if forced && !original_forced {
            tracing::warn!(
                signal = %signal,
                "forced shutdown requested while graceful cleanup is running; cleanup continues within its timeout"
            );
            RequestOutcome::EscalationIgnored
        } else {
            tracing::debug!(signal = %signal, forced, "shutdown already requested, ignoring");
            RequestOutcome::Ignored
        }
    }

    /// Drain shutdown requests until every sender is gone.
    pub async fn serve_requests(
        self: Arc<Self>,
        mut requests: mpsc::UnboundedReceiver<ShutdownRequest>,
    ) {
        while let Some(req) = requests.recv().await {
            self.request(req.signal, req.forced);
        }
    }

    async fn cleanup(&self, context: ShutdownContext, registry: CleanupRegistry) {
        let started = Instant::now();
        if registry.is_empty() {
            tracing::debug!("no cleanup actions registered");
        } else {
            tracing::info!(
                actions = registry.len(),
                timeout_secs = context.cleanup_timeout.as_secs_f64(),
                "cleaning up resources"
            );
        }

        let (actions, aggregate_timed_out) =
            run_actions(registry.into_execution_order(), context.cleanup_timeout).await;

        let report = ShutdownReport {
            context,
            actions,
            elapsed: started.elapsed(),
            aggregate_timed_out,
        };

        let elapsed_ms = report.elapsed.as_millis() as u64;
        if report.is_clean() {
            tracing::info!(
                succeeded = report.succeeded(),
                elapsed_ms,
                "shutdown complete"
            );
        } else {
            tracing::warn!(
                succeeded = report.succeeded(),
                failed = report.failed(),
                timed_out = report.timed_out(),
                aggregate_timed_out,
                elapsed_ms,
                "shutdown complete with cleanup problems"
            );
        }

        self.state.store(DONE, Ordering::Release);
        self.report.send_replace(Some(Arc::new(report)));
    }
}

impl ShutdownProbe for ShutdownCoordinator {
    fn is_shutdown_requested(&self) -> bool {
        ShutdownCoordinator::is_shutdown_requested(self)
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("state", &self.state())
            .field("cleanup_timeout", &self.cleanup_timeout)
            .finish_non_exhaustive()
    }
}

struct Running {
    name: String,
    priority: i32,
    started: Instant,
    handle: JoinHandle<(ActionOutcome, Duration)>,
}

/// Start `actions` in order, each on its own task under its own timeout, and
/// wait for all of them bounded by `aggregate`.
///
/// Returns the per-action reports in start order and whether the aggregate
/// timeout expired.
async fn run_actions(
    actions: Vec<CleanupAction>,
    aggregate: Duration,
) -> (Vec<ActionReport>, bool) {
    let deadline = Instant::now() + aggregate;

    let mut running = Vec::with_capacity(actions.len());
    for action in actions {
        let name = action.name().to_string();
        let priority = action.priority_value();
        let timeout = action.timeout_value();
        tracing::debug!(action = %name, priority, "starting cleanup action");

        let started = Instant::now();
        let work = action.start();
        let handle = tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, work).await {
                Ok(Ok(())) => ActionOutcome::Succeeded,
                Ok(Err(e)) => ActionOutcome::Failed(e.to_string()),
                Err(_) => ActionOutcome::TimedOut,
            };
            (outcome, started.elapsed())
        });
        running.push(Running {
            name,
            priority,
            started,
            handle,
        });
    }

    let mut aggregate_timed_out = false;
    let mut reports = Vec::with_capacity(running.len());
    for mut r in running {
        // timeout_at polls the task before the deadline, so actions that
        // already settled are still reported after the deadline has passed
        let (outcome, elapsed) = match tokio::time::timeout_at(deadline, &mut r.handle).await {
            Ok(Ok(settled)) => settled,
            Ok(Err(e)) => {
                let reason = if e.is_panic() {
                    "cleanup action panicked".to_string()
                } else {
                    e.to_string()
                };
                (ActionOutcome::Failed(reason), r.started.elapsed())
            }
            Err(_) => {
                aggregate_timed_out = true;
                r.handle.abort();
                (ActionOutcome::TimedOut, r.started.elapsed())
            }
        };

        let elapsed_ms = elapsed.as_millis() as u64;
        match &outcome {
            ActionOutcome::Succeeded => {
                tracing::info!(action = %r.name, elapsed_ms, "cleanup completed")
            }
            ActionOutcome::Failed(error) => {
                tracing::error!(action = %r.name, error = %error, "cleanup failed")
            }
            ActionOutcome::TimedOut => {
                tracing::warn!(action = %r.name, elapsed_ms, "cleanup timed out")
            }
        }

        reports.push(ActionReport {
            name: r.name,
            priority: r.priority,
            outcome,
            elapsed,
        });
    }

    if aggregate_timed_out {
        tracing::warn!(
            timeout_secs = aggregate.as_secs_f64(),
            "aggregate cleanup timeout reached, outstanding actions cancelled"
        );
    }
    (reports, aggregate_timed_out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{EXIT_CLEAN, EXIT_FAILURE, EXIT_FORCED_FAILURE};
    use std::sync::atomic::AtomicUsize;

    fn coordinator(cleanup_timeout: Duration) -> Arc<ShutdownCoordinator> {
        Arc::new(ShutdownCoordinator::new(cleanup_timeout))
    }

    fn recording(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> CleanupAction {
        let log = Arc::clone(log);
        CleanupAction::new(name, move || {
            log.lock().unwrap().push(name);
            async { Ok(()) }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_state() {
        let c = coordinator(DEFAULT_CLEANUP_TIMEOUT);
        assert_eq!(c.state(), CoordinatorState::Idle);
        assert!(!c.is_shutdown_requested());
        assert!(c.context().is_none());
        assert!(!*c.shutdown_signal().borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_priority_order_and_clean_exit() {
        let c = coordinator(DEFAULT_CLEANUP_TIMEOUT);
        let log = Arc::new(Mutex::new(Vec::new()));
        c.register_cleanup(recording("netclient", &log).priority(1).timeout(Duration::from_secs(5)))
            .unwrap();
        c.register_cleanup(recording("downloader", &log).priority(2).timeout(Duration::from_secs(5)))
            .unwrap();

        assert_eq!(c.request(TerminationSignal::Interrupt, false), RequestOutcome::Started);
        let report = c.wait_for_completion().await;

        assert_eq!(*log.lock().unwrap(), vec!["downloader", "netclient"]);
        assert_eq!(c.state(), CoordinatorState::Done);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.exit_code(), EXIT_CLEAN);
        assert_eq!(report.actions[0].name, "downloader");
        assert!(!report.context.forced);
        assert_eq!(report.context.signal, TerminationSignal::Interrupt);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_is_ignored() {
        let c = coordinator(DEFAULT_CLEANUP_TIMEOUT);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        c.register_cleanup(CleanupAction::new("count", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

        assert_eq!(c.request(TerminationSignal::Interrupt, false), RequestOutcome::Started);
        assert_eq!(c.request(TerminationSignal::Interrupt, false), RequestOutcome::Ignored);
        let report = c.wait_for_completion().await;
        assert_eq!(c.request(TerminationSignal::Interrupt, false), RequestOutcome::Ignored);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(report.actions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_request_during_graceful_is_log_only() {
        let c = coordinator(DEFAULT_CLEANUP_TIMEOUT);
        c.register_cleanup(CleanupAction::new("slow", || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        }))
        .unwrap();

        c.request(TerminationSignal::Interrupt, false);
        assert_eq!(
            c.request(TerminationSignal::Interrupt, true),
            RequestOutcome::EscalationIgnored
        );
        let report = c.wait_for_completion().await;
        assert!(!report.context.forced);
        assert_eq!(report.outcome_of("slow"), Some(&ActionOutcome::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_action_does_not_block_siblings() {
        let c = coordinator(DEFAULT_CLEANUP_TIMEOUT);
        c.register_cleanup(CleanupAction::new("broken", || async {
            Err("connection reset".into())
        }))
        .unwrap();
        c.register_cleanup(CleanupAction::new("healthy", || async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }))
        .unwrap();

        c.request(TerminationSignal::Terminate, true);
        let report = c.wait_for_completion().await;

        assert_eq!(
            report.outcome_of("broken"),
            Some(&ActionOutcome::Failed("connection reset".to_string()))
        );
        assert_eq!(report.outcome_of("healthy"), Some(&ActionOutcome::Succeeded));
        assert_eq!(report.exit_code(), EXIT_FORCED_FAILURE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_action_is_recorded_as_failed() {
        let c = coordinator(DEFAULT_CLEANUP_TIMEOUT);
        c.register_cleanup(CleanupAction::new("panics", || async {
            if true {
                panic!("cleanup bug");
            }
            Ok(())
        }))
        .unwrap();
        c.register_cleanup(CleanupAction::new("fine", || async { Ok(()) }))
            .unwrap();

        c.request(TerminationSignal::Interrupt, false);
        let report = c.wait_for_completion().await;
        assert!(matches!(report.outcome_of("panics"), Some(ActionOutcome::Failed(_))));
        assert_eq!(report.outcome_of("fine"), Some(&ActionOutcome::Succeeded));
        assert_eq!(report.exit_code(), EXIT_FAILURE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_timeout_marks_timed_out() {
        let c = coordinator(Duration::from_secs(10));
        c.register_cleanup(
            CleanupAction::new("sleepy", || async {
                tokio::time::sleep(Duration::from_secs(20)).await;
                Ok(())
            })
            .timeout(Duration::from_secs(1)),
        )
        .unwrap();

        let start = Instant::now();
        c.request(TerminationSignal::Interrupt, false);
        let report = c.wait_for_completion().await;
        let elapsed = start.elapsed();

        assert_eq!(report.outcome_of("sleepy"), Some(&ActionOutcome::TimedOut));
        assert!(elapsed <= Duration::from_secs(10) + Duration::from_millis(100));
        assert!(!report.aggregate_timed_out);
        assert_ne!(report.exit_code(), EXIT_CLEAN);
        assert_eq!(c.state(), CoordinatorState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregate_timeout_bounds_never_completing_action() {
        let c = coordinator(Duration::from_secs(10));
        c.register_cleanup(
            CleanupAction::new("stuck", || std::future::pending())
                .timeout(Duration::from_secs(60)),
        )
        .unwrap();
        c.register_cleanup(CleanupAction::new("quick", || async { Ok(()) }))
            .unwrap();

        let start = Instant::now();
        c.request(TerminationSignal::Interrupt, false);
        let report = c.wait_for_completion().await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed <= Duration::from_secs(10) + Duration::from_millis(100));
        assert!(report.aggregate_timed_out);
        assert_eq!(report.outcome_of("stuck"), Some(&ActionOutcome::TimedOut));
        assert_eq!(report.outcome_of("quick"), Some(&ActionOutcome::Succeeded));
        assert_eq!(report.exit_code(), EXIT_FAILURE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_after_shutdown_rejected() {
        let c = coordinator(DEFAULT_CLEANUP_TIMEOUT);
        c.request(TerminationSignal::Interrupt, false);
        let err = c
            .register_cleanup(CleanupAction::new("late", || async { Ok(()) }))
            .unwrap_err();
        assert_eq!(
            err,
            RegistrationError::ShutdownInProgress {
                name: "late".to_string()
            }
        );
        let report = c.wait_for_completion().await;
        assert!(report.actions.is_empty());
        assert_eq!(report.exit_code(), EXIT_CLEAN);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_registration_rejected() {
        let c = coordinator(DEFAULT_CLEANUP_TIMEOUT);
        c.register_cleanup(CleanupAction::new("db", || async { Ok(()) }))
            .unwrap();
        assert!(matches!(
            c.register_cleanup(CleanupAction::new("db", || async { Ok(()) })),
            Err(RegistrationError::Duplicate { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_before_and_after_request_are_woken() {
        let c = coordinator(DEFAULT_CLEANUP_TIMEOUT);
        let early = {
            let c = Arc::clone(&c);
            tokio::spawn(async move { c.wait_for_shutdown().await })
        };
        let mut signal = c.shutdown_signal();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!early.is_finished());

        c.set_current_operation("copying movie.mkv");
        c.request(TerminationSignal::StopFile, false);

        early.await.unwrap();
        signal.wait_for(|v| *v).await.unwrap();
        // A waiter that arrives late returns immediately
        c.wait_for_shutdown().await;

        let context = c.context().unwrap();
        assert_eq!(context.operation, "copying movie.mkv");
        assert_eq!(context.signal, TerminationSignal::StopFile);
        assert_eq!(context.cleanup_timeout, DEFAULT_CLEANUP_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_requests_applies_first_request() {
        let c = coordinator(DEFAULT_CLEANUP_TIMEOUT);
        let (tx, rx) = mpsc::unbounded_channel();
        let server = tokio::spawn(Arc::clone(&c).serve_requests(rx));

        tx.send(ShutdownRequest {
            signal: TerminationSignal::Terminate,
            forced: true,
        })
        .unwrap();
        tx.send(ShutdownRequest {
            signal: TerminationSignal::Interrupt,
            forced: false,
        })
        .unwrap();
        drop(tx);

        server.await.unwrap();
        let report = c.wait_for_completion().await;
        assert_eq!(report.context.signal, TerminationSignal::Terminate);
        assert!(report.context.forced);
    }
}
