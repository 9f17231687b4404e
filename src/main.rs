use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, bail};
use clap::Parser;
use console::Style;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vlm_batch::checkpoint::{self, FsCheckpointStore};
use vlm_batch::cli::{Cli, Command};
use vlm_batch::config::BatchConfig;
use vlm_batch::executor::{TaskExecutor, ValidationPolicy};
use vlm_batch::ledger::CostLedger;
use vlm_batch::orchestrator::{PoolManager, ShutdownHandle};
use vlm_batch::scoring::ScoringClient;
use vlm_batch::source::ImageSource;
use vlm_batch::ui::{self, RunProgress};

const EXIT_INTERRUPTED: u8 = 130;

// Upper bound on discovered-but-unclaimed paths.
const SOURCE_BUFFER: usize = 4096;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", Style::new().red().bold().apply_to("error:"));
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = BatchConfig::load(cli.config.as_deref())?;
    if let Some(n) = cli.max_attempts {
        config.max_attempts = n;
    }
    if let Some(secs) = cli.timeout {
        config.request_timeout_secs = secs;
    }

    match cli.command {
        Command::Run {
            root_dir,
            force_rerun,
            concurrency,
            fail_on_invalid_response,
        } => {
            if let Some(n) = concurrency {
                config.max_concurrency = n;
            }
            if fail_on_invalid_response {
                config.validation_policy = ValidationPolicy::Fail;
            }
            config.validate()?;
            if !root_dir.is_dir() {
                bail!("{} is not a directory", root_dir.display());
            }
            info!(?config, root = %root_dir.display(), "configuration loaded");

            let client = ScoringClient::new(config.client_settings())?;
            let executor = TaskExecutor::new(
                Arc::new(client),
                config.request_timeout(),
                config.validation_policy,
            );
            let ledger = Arc::new(CostLedger::new(config.pricing()));
            let pool = PoolManager::with_progress(
                executor,
                Arc::new(FsCheckpointStore::new()),
                Arc::clone(&ledger),
                config.pool_settings(force_rerun),
                Arc::new(RunProgress::start(&root_dir)),
            );
            spawn_signal_handler(pool.shutdown_handle());

            let items = ImageSource::new(&root_dir, &config.extensions)
                .into_stream(config.max_concurrency.min(SOURCE_BUFFER));
            let started = Instant::now();
            let summary = pool.run(items).await;
            ui::print_summary(&summary, &ledger.snapshot(), started.elapsed());

            if summary.interrupted {
                Ok(ExitCode::from(EXIT_INTERRUPTED))
            } else if summary.unrecorded > 0 || summary.panicked > 0 {
                Ok(ExitCode::FAILURE)
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Command::Status { root_dir } => {
            if !root_dir.is_dir() {
                bail!("{} is not a directory", root_dir.display());
            }
            let items = ImageSource::new(&root_dir, &config.extensions).into_stream(SOURCE_BUFFER);
            let counts = checkpoint::tally(&FsCheckpointStore::new(), items).await;
            ui::print_status(&root_dir, &counts);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// First signal drains gracefully; a second one abandons in-flight work.
fn spawn_signal_handler(handle: ShutdownHandle) {
    tokio::spawn(async move {
        wait_for_signal().await;
        warn!("interrupt received, finishing in-flight requests (repeat to abort)");
        handle.request_shutdown();
        wait_for_signal().await;
        warn!("second interrupt, aborting");
        handle.abort();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
