use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use agentvec::config::StoreConfig;
use agentvec::manager::{self, SystemProfile};
use agentvec::{AgentVecDb, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// JSON store config; defaults apply when omitted
    #[clap(long)]
    config: Option<PathBuf>,

    /// Overrides `data_dir` from the config
    #[clap(long)]
    data_dir: Option<PathBuf>,

    /// Overrides `maintenance.interval_ms` from the config
    #[clap(long)]
    compact_interval_ms: Option<u64>,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Debug)]
enum Command {
    /// Open the store and run maintenance until Ctrl-C (default)
    Serve,
    /// Print store statistics as JSON
    Stats,
    /// Compact the log once, keeping `history_limit` versions per record
    Compact,
    /// Write the latest version of every record to a JSON file
    Export { path: PathBuf },
    /// Replace the store contents with a JSON export
    Import { path: PathBuf },
}

fn main() -> ExitCode {
    let profile = SystemProfile::detect();

    println!("--- [AgentVec Resource Manager] ---");
    println!("Detected Cores: {}", profile.logical_cores);
    println!("Worker Threads: {}", profile.worker_threads);
    println!("Durability Mode: {}", if profile.strict_durability { "Strict (Fsync)" } else { "High Throughput (Async)" });
    if let Some(notice) = profile.notice() {
        println!("Warning: {notice}");
    }
    println!("-----------------------------------");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(profile.worker_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(async_main(profile)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "agentvec exited with error");
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args, profile: &SystemProfile) -> Result<StoreConfig> {
    let mut config = match &args.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::default(),
    };
    if let Some(dir) = &args.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(ms) = args.compact_interval_ms {
        config.maintenance.interval_ms = ms;
    }
    // single-core hosts turn fsync off; config can too
    config.strict_durability &= profile.strict_durability;
    config.validate()?;
    Ok(config)
}

async fn async_main(profile: SystemProfile) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,agentvec=info")))
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();
    let config = load_config(&args, &profile)?;
    let maintenance = config.maintenance;

    let db = Arc::new(AgentVecDb::open(config)?);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(db, maintenance).await,
        Command::Stats => {
            let stats = db.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Compact => {
            let stats = db.compact(maintenance.history_limit)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Export { path } => {
            let count = db.export_json(&path)?;
            println!("exported {count} records to {}", path.display());
            Ok(())
        }
        Command::Import { path } => {
            let count = db.import_json(&path)?;
            db.sync()?;
            println!("imported {count} records from {}", path.display());
            Ok(())
        }
    }
}

async fn serve(db: Arc<AgentVecDb>, maintenance: agentvec::config::MaintenanceConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    let handle = manager::spawn_maintenance(db.clone(), maintenance, cancel.clone());
    info!(records = db.len(), "store ready, Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C, shutting down");
    }
    info!("shutting down");
    cancel.cancel();

    match handle.await {
        Ok(Ok(report)) => info!(
            passes = report.passes,
            failed = report.failed_attempts,
            dropped = report.versions_dropped,
            purged = report.deleted_purged,
            "maintenance stopped"
        ),
        Ok(Err(e)) => error!(error = %e, "maintenance failed"),
        Err(e) => error!(error = %e, "maintenance task panicked"),
    }

    db.sync()
}
