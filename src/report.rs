/// Outcome of a shutdown episode: per-action results plus the exit code policy.
use crate::coordinator::ShutdownContext;
use std::time::Duration;

/// Exit code when every cleanup action succeeded.
pub const EXIT_CLEAN: i32 = 0;
/// Exit code when a graceful shutdown had failed or timed-out actions.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code when a forced shutdown had failed or timed-out actions.
pub const EXIT_FORCED_FAILURE: i32 = 2;

/// How a single cleanup action settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Succeeded,
    /// The action returned an error (or panicked).
    Failed(String),
    /// The action outlived its own timeout or the aggregate cleanup timeout.
    TimedOut,
}

impl ActionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ActionOutcome::Succeeded)
    }
}

/// Result of one cleanup action.
#[derive(Debug, Clone)]
pub struct ActionReport {
    pub name: String,
    pub priority: i32,
    pub outcome: ActionOutcome,
    /// Time from start until the action settled or was cancelled.
    pub elapsed: Duration,
}

/// Everything that happened during one shutdown episode.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub context: ShutdownContext,
    /// Per-action results, in start order.
    pub actions: Vec<ActionReport>,
    /// Wall time of the whole cleanup protocol.
    pub elapsed: Duration,
    /// Whether the aggregate timeout cut the cleanup short.
    pub aggregate_timed_out: bool,
}

impl ShutdownReport {
    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, ActionOutcome::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ActionOutcome::Failed(_)))
    }

    pub fn timed_out(&self) -> usize {
        self.count(|o| matches!(o, ActionOutcome::TimedOut))
    }

    fn count(&self, pred: impl Fn(&ActionOutcome) -> bool) -> usize {
        self.actions.iter().filter(|a| pred(&a.outcome)).count()
    }

    /// True when no action failed or timed out.
    pub fn is_clean(&self) -> bool {
        self.actions.iter().all(|a| a.outcome.is_success())
    }

    /// Outcome of the named action, if it was registered.
    pub fn outcome_of(&self, name: &str) -> Option<&ActionOutcome> {
        self.actions
            .iter()
            .find(|a| a.name == name)
            .map(|a| &a.outcome)
    }

    /// Process exit code for this shutdown.
    ///
    /// Clean cleanup exits 0 whether or not the shutdown was forced. Failures
    /// and timeouts exit 1 for graceful shutdowns and 2 for forced ones.
    pub fn exit_code(&self) -> i32 {
        if self.is_clean() {
            EXIT_CLEAN
        } else if self.context.forced {
            EXIT_FORCED_FAILURE
        } else {
            EXIT_FAILURE
        }
    }
}
