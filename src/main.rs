//! # SkyAlert — weather alert scheduler & dispatcher
//!
//! Evaluates weather forecasts against subscriber alert rules on a
//! configured cadence and dispatches notification emails through a durable
//! queue, with windowed deduplication and an optional manual-approval
//! stage.
//!
//! Usage:
//!   skyalert                          # resident scheduler loop (ctrl-c to stop)
//!   skyalert --run-once               # one evaluation cycle, then exit
//!   skyalert --data-dir ./data        # custom data directory
//!   skyalert --clear-queues           # operator reset of queued state

use anyhow::Result;
use clap::Parser;
use skyalert_core::config::Paths;
use skyalert_engine::AlertService;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skyalert", version, about = "⛅ SkyAlert — weather alert scheduler & dispatcher")]
struct Cli {
    /// Data directory holding settings, rules and durable state
    /// (defaults to ~/.skyalert)
    #[arg(long)]
    data_dir: Option<String>,

    /// Run a single evaluation cycle and exit
    #[arg(long)]
    run_once: bool,

    /// Run a single cycle in test mode (payloads flagged is_test)
    #[arg(long)]
    test_run: bool,

    /// Delete all queued tasks and pending notifications, then exit
    #[arg(long)]
    clear_queues: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "skyalert=debug,skyalert_engine=debug,skyalert_weather=debug,skyalert_store=debug"
    } else {
        "skyalert=info,skyalert_engine=info,skyalert_weather=info,skyalert_store=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let paths = match &cli.data_dir {
        Some(dir) => Paths::new(dir),
        None => Paths::new(Paths::default_base()),
    };
    tracing::info!("Data directory: {}", paths.base().display());

    let service = AlertService::open(paths)?;

    if cli.clear_queues {
        let (tasks, notifications) = service.clear_queues()?;
        println!("Cleared {tasks} task(s) and {notifications} notification(s)");
        return Ok(());
    }

    if cli.run_once || cli.test_run {
        let candidates = if cli.test_run {
            service.run_test_cycle().await?
        } else {
            service.run_cycle_now().await?
        };
        println!("Cycle complete: {candidates} candidate(s)");
        return Ok(());
    }

    service.start().await?;
    tracing::info!("SkyAlert running. Press ctrl-c to stop.");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down…");
    service.stop().await?;
    Ok(())
}
