//! Spillway Replayer
//!
//! Reads the dump store and republishes every record once the broker is
//! reachable again. Runs on an interval until Ctrl+C/SIGTERM, or a single
//! pass with `--once`.
//!
//! Uses its own AMQP client, so a stalled replay never holds the connection
//! of live publishers. The replay path never dumps: a failed republish stays
//! in the store with its attempt counted.
//!
//! ## Configuration
//!
//! Loaded from `--config`, `SPILLWAY_CONFIG` or the standard search paths,
//! then overridden by `SPILLWAY_*` environment variables. `RUST_LOG` and
//! `LOG_FORMAT` control logging.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use sw_amqp::{AmqpClient, JobService, LapinConnector};
use sw_common::JobType;
use sw_config::{AppConfig, ConfigLoader};
use sw_dump::{
    Dumper, MemoryDumpStore, RecordFilter, RecoveryConfig, RecoveryTask, Replayer,
    SqliteDumpStore,
};

#[derive(Parser, Debug)]
#[command(name = "sw-replayer")]
#[command(about = "Spillway Replayer - republishes dumped messages")]
struct Args {
    /// Config file path
    #[arg(long, env = "SPILLWAY_CONFIG")]
    config: Option<String>,

    /// Run a single recovery pass and exit
    #[arg(long)]
    once: bool,

    /// Only replay records of this job type (MESSAGE, FUNCTION_CALL)
    #[arg(long)]
    job_type: Option<String>,

    /// Only replay records for this queue
    #[arg(long)]
    queue: Option<String>,

    /// Seconds between recovery passes
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Print an example configuration file and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", AppConfig::example_toml());
        return Ok(());
    }

    sw_common::logging::init_logging("sw-replayer");

    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader.load()?;

    info!("Starting Spillway Replayer");

    let filter = build_filter(&args, &config)?;
    let store = open_store(&config).await?;
    let pending = store.count(&filter).await?;
    info!(pending, "Dump store opened ({})", config.dump.backend);

    let client = Arc::new(AmqpClient::from_config(&config, Arc::new(LapinConnector::new())));
    let service = Arc::new(JobService::new(Arc::clone(&client)));
    let replayer = Arc::new(
        Replayer::new(store, client.clone())
            .with_hook(service)
            .with_max_attempts(config.replay.max_attempts)
            .with_last_error(Arc::clone(client.last_error())),
    );

    if args.once {
        let report = replayer.recover(&filter).await?;
        info!(
            scanned = report.scanned,
            replayed = report.replayed,
            failed = report.failed,
            exhausted = report.exhausted,
            "Single recovery pass complete"
        );
        if report.failed > 0 {
            if let Some(err) = client.last_error().last_error() {
                warn!(code = err.code, "Last recovery error: {}", err);
            }
        }
        return Ok(());
    }

    let interval = Duration::from_secs(args.interval_secs.unwrap_or(config.replay.interval_secs).max(1));
    let task = RecoveryTask::new(
        replayer,
        RecoveryConfig {
            interval,
            filter,
            enabled: config.replay.enabled,
        },
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let shutdown_rx = shutdown_tx.subscribe();
    let handle = tokio::spawn(async move { task.run(shutdown_rx).await });

    shutdown_signal().await;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());

    if let Err(e) = handle.await {
        error!(error = %e, "Recovery task ended abnormally");
    }

    info!("Spillway Replayer stopped");
    Ok(())
}

fn build_filter(args: &Args, config: &AppConfig) -> Result<RecordFilter> {
    let mut filter = RecordFilter::all().limit(config.replay.batch_size);

    if let Some(name) = args.job_type.as_ref().or(config.replay.job_type.as_ref()) {
        let job_type = JobType::from_str(name)
            .ok_or_else(|| anyhow::anyhow!("unknown job type '{}'", name))?;
        filter = filter.job_type(job_type);
    }
    if let Some(queue) = &args.queue {
        filter = filter.queue(queue.clone());
    }
    Ok(filter)
}

async fn open_store(config: &AppConfig) -> Result<Arc<dyn Dumper>> {
    match config.dump.backend.as_str() {
        "memory" => {
            warn!("Memory dump store selected, nothing dumped by other processes is visible");
            Ok(Arc::new(MemoryDumpStore::new()))
        }
        _ => {
            std::fs::create_dir_all(&config.data_dir)?;
            let store =
                SqliteDumpStore::connect(&config.dump.database_url, config.dump.max_connections)
                    .await?;
            info!("Using SQLite dump store: {}", config.dump.database_url);
            Ok(Arc::new(store))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
