/// Signal handling for graceful shutdown.
///
/// Handles SIGINT (Ctrl-C), SIGTERM and SIGQUIT.
/// First SIGINT: graceful shutdown.
/// Second SIGINT within the rapid window: the request is marked forced.
/// SIGTERM / SIGQUIT: always forced.
///
/// Tokio's signal driver owns the actual OS handler; the observer runs as an
/// ordinary task and only enqueues [`ShutdownRequest`]s for the coordinator.
use nix::sys::signal::Signal;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Kinds of termination request the coordinator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationSignal {
    /// SIGINT (Ctrl-C). Escalates on rapid repeats.
    Interrupt,
    /// SIGTERM. Always forced.
    Terminate,
    /// SIGQUIT. Always forced.
    Quit,
    /// The configured STOP file appeared.
    StopFile,
    /// The workload ran to completion. Never delivered by the host.
    Finished,
}

impl TerminationSignal {
    /// The host signal backing this kind, if any.
    pub fn host_signal(self) -> Option<Signal> {
        match self {
            TerminationSignal::Interrupt => Some(Signal::SIGINT),
            TerminationSignal::Terminate => Some(Signal::SIGTERM),
            TerminationSignal::Quit => Some(Signal::SIGQUIT),
            TerminationSignal::StopFile | TerminationSignal::Finished => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TerminationSignal::StopFile => "STOP file",
            TerminationSignal::Finished => "finished",
            other => other.host_signal().map(Signal::as_str).unwrap_or("unknown"),
        }
    }
}

impl std::fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified shutdown request, ready for the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownRequest {
    pub signal: TerminationSignal,
    pub forced: bool,
}

/// When repeated interrupts turn into a forced shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    /// Interrupts closer together than this count as a rapid repeat.
    pub rapid_window: Duration,
    /// Number of rapid interrupts that forces shutdown.
    pub force_threshold: u32,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            rapid_window: Duration::from_secs(2),
            force_threshold: 2,
        }
    }
}

#[derive(Debug, Default)]
struct SignalHistory {
    count: u32,
    last: Option<Instant>,
}

/// Classifies signal deliveries into shutdown requests.
///
/// Only interrupts carry history; terminate and quit are forced unconditionally.
#[derive(Debug)]
pub struct SignalObserver {
    policy: EscalationPolicy,
    history: SignalHistory,
}

impl SignalObserver {
    pub fn new(policy: EscalationPolicy) -> Self {
        Self {
            policy,
            history: SignalHistory::default(),
        }
    }

    /// Classify one delivery of `signal` observed at `now`.
    pub fn classify(&mut self, signal: TerminationSignal, now: Instant) -> ShutdownRequest {
        let forced = match signal {
            TerminationSignal::Interrupt => {
                let rapid = self.history.last.is_some_and(|last| {
                    now.saturating_duration_since(last) < self.policy.rapid_window
                });
                self.history.count = if rapid { self.history.count + 1 } else { 1 };
                self.history.last = Some(now);

                let forced = self.history.count >= self.policy.force_threshold;
                if forced {
                    tracing::warn!(
                        count = self.history.count,
                        "repeated {} received, forcing shutdown",
                        signal
                    );
                }
                forced
            }
            TerminationSignal::Terminate | TerminationSignal::Quit => true,
            TerminationSignal::StopFile | TerminationSignal::Finished => false,
        };
        ShutdownRequest { signal, forced }
    }
}

/// Errors from installing signal handlers.
#[derive(Debug)]
pub enum SignalError {
    /// The host refused a handler for this signal.
    Install {
        signal: TerminationSignal,
        source: std::io::Error,
    },
    /// No handler could be installed at all.
    NothingInstalled,
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::Install { signal, source } => {
                write!(f, "failed to install {} handler: {}", signal, source)
            }
            SignalError::NothingInstalled => write!(f, "no signal handler could be installed"),
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::Install { source, .. } => Some(source),
            SignalError::NothingInstalled => None,
        }
    }
}

/// Running signal observer. Dropping it stops forwarding signals.
pub struct SignalHandler {
    installed: Vec<TerminationSignal>,
    task: JoinHandle<()>,
}

impl SignalHandler {
    /// Signals that are being observed.
    #[allow(dead_code)]
    pub fn installed(&self) -> &[TerminationSignal] {
        &self.installed
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn listen(kind: SignalKind, which: TerminationSignal) -> Option<tokio::signal::unix::Signal> {
    match signal(kind) {
        Ok(stream) => Some(stream),
        Err(source) => {
            let err = SignalError::Install {
                signal: which,
                source,
            };
            // The host default disposition stays in effect for this signal
            tracing::error!(error = %err, "signal handler unavailable, using default behaviour");
            None
        }
    }
}

async fn recv(stream: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match stream {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

/// Install handlers for SIGINT, SIGTERM and SIGQUIT and forward classified
/// requests to `requests`.
///
/// Must be called from within a tokio runtime. A signal whose handler cannot
/// be installed keeps its default disposition; only when none can be
/// installed is an error returned.
pub fn install(
    policy: EscalationPolicy,
    requests: UnboundedSender<ShutdownRequest>,
) -> Result<SignalHandler, SignalError> {
    let mut sigint = listen(SignalKind::interrupt(), TerminationSignal::Interrupt);
    let mut sigterm = listen(SignalKind::terminate(), TerminationSignal::Terminate);
    let mut sigquit = listen(SignalKind::quit(), TerminationSignal::Quit);

    let installed: Vec<TerminationSignal> = [
        (sigint.is_some(), TerminationSignal::Interrupt),
        (sigterm.is_some(), TerminationSignal::Terminate),
        (sigquit.is_some(), TerminationSignal::Quit),
    ]
    .into_iter()
    .filter_map(|(ok, which)| ok.then_some(which))
    .collect();

    if installed.is_empty() {
        return Err(SignalError::NothingInstalled);
    }
    tracing::debug!(signals = ?installed, "signal handlers installed");

    let mut observer = SignalObserver::new(policy);
    let task = tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                r = recv(&mut sigint) => r.map(|_| TerminationSignal::Interrupt),
                r = recv(&mut sigterm) => r.map(|_| TerminationSignal::Terminate),
                r = recv(&mut sigquit) => r.map(|_| TerminationSignal::Quit),
            };
            let Some(which) = received else {
                tracing::debug!("signal stream closed, observer exiting");
                break;
            };

            let request = observer.classify(which, Instant::now());
            tracing::debug!(signal = %which, forced = request.forced, "signal received");
            if requests.send(request).is_err() {
                tracing::debug!("shutdown request channel closed, observer exiting");
                break;
            }
        }
    });

    Ok(SignalHandler { installed, task })
}
