/// Cleanup registry: named, prioritized teardown actions registered by
/// long-lived components at startup and executed once during shutdown.
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Default per-action timeout.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type produced by a failing cleanup action.
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

/// The future a cleanup action resolves to.
pub type CleanupFuture = Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send>>;

type CleanupFn = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// A named unit of teardown work.
///
/// The action is a factory: invoking it starts the work and returns the
/// future that completes it. Synchronous work is wrapped with
/// [`CleanupAction::blocking`], which runs it on tokio's blocking pool.
pub struct CleanupAction {
    name: String,
    priority: i32,
    timeout: Duration,
    run: CleanupFn,
}

impl CleanupAction {
    /// Create an action from an async closure with priority 0 and the default timeout.
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            priority: 0,
            timeout: DEFAULT_ACTION_TIMEOUT,
            run: Box::new(move || Box::pin(action())),
        }
    }

    /// Create an action from synchronous work.
    ///
    /// The work runs on a blocking-pool thread. If it outlives its timeout the
    /// wrapper gives up on it, but the thread itself cannot be interrupted and
    /// keeps running until the call returns or the process exits.
    pub fn blocking<F>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Result<(), ActionError> + Send + 'static,
    {
        Self::new(name, move || async move {
            match tokio::task::spawn_blocking(action).await {
                Ok(result) => result,
                Err(e) => Err(Box::new(e) as ActionError),
            }
        })
    }

    /// Set the priority. Higher priorities start first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the per-action timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority_value(&self) -> i32 {
        self.priority
    }

    pub fn timeout_value(&self) -> Duration {
        self.timeout
    }

    /// Start the action, consuming it.
    pub fn start(self) -> CleanupFuture {
        (self.run)()
    }
}

impl std::fmt::Debug for CleanupAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupAction")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Errors from cleanup registration. Never fatal to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// An action with this name is already registered.
    Duplicate { name: String },
    /// Shutdown already started; the registry is closed.
    ShutdownInProgress { name: String },
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationError::Duplicate { name } => {
                write!(f, "cleanup action '{}' is already registered", name)
            }
            RegistrationError::ShutdownInProgress { name } => {
                write!(
                    f,
                    "cannot register cleanup action '{}': shutdown already in progress",
                    name
                )
            }
        }
    }
}

impl std::error::Error for RegistrationError {}

/// Ordered collection of cleanup actions, in registration order.
#[derive(Debug, Default)]
pub struct CleanupRegistry {
    actions: Vec<CleanupAction>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action. Names must be unique.
    pub fn register(&mut self, action: CleanupAction) -> Result<(), RegistrationError> {
        if self.contains(action.name()) {
            return Err(RegistrationError::Duplicate {
                name: action.name,
            });
        }
        self.actions.push(action);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.iter().any(|a| a.name == name)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Consume the registry, yielding actions in execution order:
    /// descending priority, ties kept in registration order.
    pub fn into_execution_order(self) -> Vec<CleanupAction> {
        let mut actions = self.actions;
        // sort_by_key is stable
        actions.sort_by_key(|a| std::cmp::Reverse(a.priority));
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str, priority: i32) -> CleanupAction {
        CleanupAction::new(name.to_string(), || async { Ok(()) }).priority(priority)
    }

    fn order_of(registry: CleanupRegistry) -> Vec<String> {
        registry
            .into_execution_order()
            .into_iter()
            .map(|a| a.name().to_string())
            .collect()
    }

    #[test]
    fn test_defaults() {
        let action = CleanupAction::new("x", || async { Ok(()) });
        assert_eq!(action.priority_value(), 0);
        assert_eq!(action.timeout_value(), Duration::from_secs(5));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = CleanupRegistry::new();
        registry.register(noop("netclient", 1)).unwrap();
        let err = registry.register(noop("netclient", 7)).unwrap_err();
        assert_eq!(
            err,
            RegistrationError::Duplicate {
                name: "netclient".to_string()
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_higher_priority_first() {
        let mut registry = CleanupRegistry::new();
        registry.register(noop("netclient", 1)).unwrap();
        registry.register(noop("downloader", 2)).unwrap();
        assert_eq!(order_of(registry), vec!["downloader", "netclient"]);
    }

    #[test]
    fn test_ties_keep_registration_order() {
        let mut registry = CleanupRegistry::new();
        registry.register(noop("a", 0)).unwrap();
        registry.register(noop("b", 3)).unwrap();
        registry.register(noop("c", 0)).unwrap();
        registry.register(noop("d", 3)).unwrap();
        registry.register(noop("e", -1)).unwrap();
        assert_eq!(order_of(registry), vec!["b", "d", "a", "c", "e"]);
    }

    #[test]
    fn test_randomized_priorities_are_stable_sorted() {
        let mut rng = fastrand::Rng::with_seed(0x5eed);
        for _ in 0..50 {
            let n = rng.usize(1..40);
            let mut registry = CleanupRegistry::new();
            let mut expected: Vec<(i32, usize)> = Vec::with_capacity(n);
            for i in 0..n {
                // Narrow range so duplicate priorities are common
                let priority = rng.i32(-3..=3);
                registry.register(noop(&i.to_string(), priority)).unwrap();
                expected.push((priority, i));
            }
            expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            let expected: Vec<String> = expected.iter().map(|(_, i)| i.to_string()).collect();
            assert_eq!(order_of(registry), expected);
        }
    }

    #[tokio::test]
    async fn test_blocking_action_runs_and_reports_error() {
        let ok = CleanupAction::blocking("ok", || Ok(()));
        assert!(ok.start().await.is_ok());

        let failing = CleanupAction::blocking("bad", || Err("disk on fire".into()));
        let err = failing.start().await.unwrap_err();
        assert_eq!(err.to_string(), "disk on fire");
    }
}
