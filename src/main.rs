mod config;
mod coordinator;
mod lockfile;
mod registry;
mod report;
mod signals;
mod stopfile;
mod transfer;

use clap::Parser;
use config::Config;
use coordinator::{ShutdownCoordinator, ShutdownProbe};
use lockfile::{LockFile, LOCK_FILE_NAME};
use signals::{ShutdownRequest, TerminationSignal};
use std::path::PathBuf;
use std::sync::Arc;
use stopfile::StopFileWatcher;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use transfer::{Downloader, Source, TransferOutcome};

/// Copy files into an output directory in chunks, shutting down cleanly on
/// SIGINT, SIGTERM, SIGQUIT or a STOP file.
#[derive(Parser, Debug)]
#[command(name = "tidyexit", version, about)]
pub struct Cli {
    /// Files to copy (`-` reads stdin)
    #[arg(value_name = "SOURCES", required = true)]
    sources: Vec<String>,

    /// Config file path
    #[arg(short, long, default_value = "tidyexit.toml")]
    config: PathBuf,

    /// Output directory (overrides config)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Aggregate cleanup timeout in seconds (overrides config)
    #[arg(long)]
    cleanup_timeout: Option<u64>,

    /// Chunk size in bytes (overrides config)
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Pause after each chunk, in milliseconds (overrides config)
    #[arg(long)]
    throttle_ms: Option<u64>,

    /// STOP file path (overrides config)
    #[arg(long)]
    stop_file: Option<PathBuf>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (cleanup registration, signal classification)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings, errors and the shutdown summary
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(dir) = &self.output_dir {
            config.transfer.output_dir = dir.clone();
        }
        if let Some(secs) = self.cleanup_timeout {
            config.shutdown.cleanup_timeout_secs = secs;
        }
        if let Some(size) = self.chunk_size {
            config.transfer.chunk_size = size;
        }
        if let Some(ms) = self.throttle_ms {
            config.transfer.throttle_ms = ms;
        }
        if let Some(path) = &self.stop_file {
            config.shutdown.stop_file = path.clone();
        }
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            std::process::exit(report::EXIT_FAILURE);
        }
    };
    cli.apply_overrides(&mut config);
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid settings");
        std::process::exit(report::EXIT_FAILURE);
    }

    if cli.dry_run {
        println!("tidyexit v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("{config:#?}");
        return;
    }

    let sources: Vec<Source> = cli.sources.iter().map(|s| Source::parse(s)).collect();
    let code = run(config, sources).await;
    std::process::exit(code);
}

/// Install signal handling, then copy every source until done or told to
/// stop. Returns the process exit code.
async fn run(config: Config, sources: Vec<Source>) -> i32 {
    let (requests, request_rx) = mpsc::unbounded_channel();

    // Kept alive for the rest of the run; dropping it stops signal forwarding
    let _signals = match signals::install(config.shutdown.escalation_policy(), requests.clone()) {
        Ok(handler) => Some(handler),
        Err(e) => {
            tracing::error!(
                error = %e,
                "signal handlers unavailable, falling back to default termination behaviour"
            );
            None
        }
    };

    copy_all(config, sources, requests, request_rx).await
}

/// Claim the output directory, register cleanup actions and copy sources.
/// Shutdown requests arrive on `request_rx`.
async fn copy_all(
    config: Config,
    sources: Vec<Source>,
    requests: mpsc::UnboundedSender<ShutdownRequest>,
    request_rx: mpsc::UnboundedReceiver<ShutdownRequest>,
) -> i32 {
    let output_dir = config.transfer.output_dir.clone();
    if let Err(e) = std::fs::create_dir_all(&output_dir) {
        tracing::error!(
            error = %e,
            dir = %output_dir.display(),
            "failed to create output directory"
        );
        return report::EXIT_FAILURE;
    }

    let lock = match LockFile::acquire(&output_dir.join(LOCK_FILE_NAME)) {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!(error = %e, "output directory is in use");
            return report::EXIT_FAILURE;
        }
    };
    tracing::debug!(path = %lock.path().display(), "output directory locked");

    let coordinator = Arc::new(ShutdownCoordinator::new(config.shutdown.cleanup_timeout()));
    tokio::spawn(Arc::clone(&coordinator).serve_requests(request_rx));

    let watcher = StopFileWatcher::new(&config.shutdown.stop_file, config.shutdown.stop_file_poll());
    tokio::spawn(watcher.watch(requests, coordinator.shutdown_signal()));

    let probe: Arc<dyn ShutdownProbe> = coordinator.clone();
    let downloader = Downloader::new(&output_dir, config.transfer.options(), probe);

    let action_timeout = config.shutdown.action_timeout();
    // Registration failures are logged by the coordinator and are not fatal
    let _ = coordinator.register_cleanup(
        downloader
            .tracker()
            .cleanup_action("downloader")
            .priority(2)
            .timeout(action_timeout),
    );
    let _ = coordinator.register_cleanup(
        lock.into_cleanup_action("lockfile")
            .priority(1)
            .timeout(action_timeout),
    );

    let mut transfer_failures = 0usize;
    let work = async {
        for source in &sources {
            if coordinator.is_shutdown_requested() {
                tracing::info!(source = %source, "skipping, shutdown in progress");
                continue;
            }
            coordinator.set_current_operation(format!("copying {source}"));
            match downloader.fetch(source).await {
                Ok(TransferOutcome::Completed { .. }) => {}
                Ok(TransferOutcome::Cancelled { .. }) => {
                    tracing::warn!(source = %source, "transfer cancelled");
                }
                Err(e) => {
                    transfer_failures += 1;
                    tracing::error!(source = %source, error = %e, "transfer failed");
                }
            }
        }
        coordinator.set_current_operation("idle");
    };

    // A transfer stuck inside a read never reaches a chunk boundary; the
    // completed cleanup is what lets the process exit in that case. Dropping
    // `work` drops that transfer's temporary file with it.
    let summary = tokio::select! {
        _ = work => {
            coordinator.request(TerminationSignal::Finished, false);
            coordinator.wait_for_completion().await
        }
        summary = coordinator.wait_for_completion() => summary,
    };

    for action in &summary.actions {
        tracing::debug!(
            action = %action.name,
            priority = action.priority,
            outcome = ?action.outcome,
            elapsed_ms = action.elapsed.as_millis() as u64,
            "cleanup result"
        );
    }

    let mut code = summary.exit_code();
    if transfer_failures > 0 && code == report::EXIT_CLEAN {
        code = report::EXIT_FAILURE;
    }
    tracing::info!(
        signal = %summary.context.signal,
        forced = summary.context.forced,
        requested_at = %summary.context.requested_at,
        aggregate_timed_out = summary.aggregate_timed_out,
        succeeded = summary.succeeded(),
        failed = summary.failed(),
        timed_out = summary.timed_out(),
        transfer_failures,
        exit_code = code,
        "exiting"
    );
    code
}
