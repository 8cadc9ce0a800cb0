use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};

use gridbatch::artifacts::{ArtifactSink, ArtifactStore, MultiStore, StagingDir, ingest};
use gridbatch::config::Config;
use gridbatch::consolidate::OutputConverter;
use gridbatch::raster::{ConversionRegistry, RegularGrid};
use gridbatch::sim::{CsvWeatherSource, PhenologyModel, UniformSoil};
use gridbatch::store::{Catalog, Db, SqlCropCalendar, TaskQueue, seed_tasks};
use gridbatch::worker::{
    Collaborators, GridScanner, Supervisor, TaskRunner, WorkerCommand, WorkerLoop,
    available_parallelism, worker_count,
};

/// Exit status for fatal errors (store unreachable, bad configuration).
const EXIT_FATAL: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;
const INGEST_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "gridbatch", version, about = "Batch crop simulation over a lon/lat grid")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Keep worker processes running until the task list is drained
    Supervise {
        /// Worker count: all cores if unset, negative leaves cores free
        #[arg(long, allow_negative_numbers = true)]
        cpus: Option<i64>,
        /// Supervise one grid scanner per crop instead of task workers
        #[arg(long = "scan-crop")]
        scan_crops: Vec<i64>,
    },
    /// Claim and simulate tasks until the queue is drained
    Work {
        /// Write results straight into a rotating store instead of staging files
        #[arg(long)]
        direct: bool,
    },
    /// Sweep every grid cell of a crop and store its temperature sum
    Scan {
        #[arg(long)]
        crop: i64,
    },
    /// Move staged results into the rotating artifact store
    Ingest {
        /// Ingest once and exit
        #[arg(long)]
        once: bool,
        /// Keep staged files after ingest, renamed with an `.ingested` suffix
        #[arg(long)]
        keep: bool,
    },
    /// Write the raster outputs of a crop
    Consolidate {
        #[arg(long)]
        crop: i64,
    },
    /// Put tasks back into Pending
    Requeue {
        #[arg(long, conflicts_with = "stale_after")]
        task: Option<i64>,
        /// Requeue Running tasks claimed more than this many seconds ago
        #[arg(long)]
        stale_after: Option<u64>,
    },
    /// Fill the task list for a crop
    Seed {
        #[arg(long)]
        crop: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };
    let _log_guard = init_tracing(config.log_dir.as_deref());

    match run(cli.command, config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

/// Log to stderr, or to a daily rolling file when a log directory is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "gridbatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

async fn run(command: Command, config: Config) -> anyhow::Result<u8> {
    match command {
        Command::Supervise { cpus, scan_crops } => supervise(&config, cpus, scan_crops).await,
        Command::Work { direct } => work(&config, direct).await,
        Command::Scan { crop } => scan(&config, crop).await,
        Command::Ingest { once, keep } => ingest_loop(&config, once, !keep).await,
        Command::Consolidate { crop } => {
            let db = open_db(&config).await?;
            let converter = OutputConverter::new(
                TaskQueue::new(db.clone()),
                Catalog::new(db),
                ConversionRegistry::with_defaults(config.grid.nodata),
                Arc::new(RegularGrid::new(config.grid)),
                config.naming.clone(),
                &config.results_dir,
            );
            let mut stores = MultiStore::open(&config.store_dir, None).await?;
            if stores.is_empty() {
                warn!(dir = %config.store_dir.display(), "No artifact stores found");
            }
            let report = converter.consolidate(&mut stores, crop).await?;
            for path in &report.files {
                eprintln!("   {}", path.display());
            }
            Ok(0)
        }
        Command::Requeue { task, stale_after } => {
            let queue = TaskQueue::new(open_db(&config).await?);
            match (task, stale_after) {
                (Some(task_id), _) => {
                    queue.requeue(task_id).await?;
                    info!(task_id, "Task requeued");
                }
                (None, Some(secs)) => {
                    let count = queue.requeue_stale(Duration::from_secs(secs)).await?;
                    info!(count, older_than_secs = secs, "Stale tasks requeued");
                }
                (None, None) => anyhow::bail!("requeue needs --task or --stale-after"),
            }
            Ok(0)
        }
        Command::Seed { crop } => {
            let db = open_db(&config).await?;
            let queue = TaskQueue::new(db.clone());
            let catalog = Catalog::new(db);
            let calendar = SqlCropCalendar::new(catalog.clone());
            let report = seed_tasks(&queue, &catalog, &calendar, &RegularGrid::new(config.grid), crop).await?;
            eprintln!("   Enqueued {} tasks for crop {crop}", report.enqueued);
            Ok(0)
        }
    }
}

async fn open_db(config: &Config) -> anyhow::Result<Arc<Db>> {
    Ok(Arc::new(Db::open_local(&config.db_path).await?))
}

fn build_runner(config: &Config, catalog: Catalog) -> Arc<TaskRunner> {
    let deps = Collaborators {
        calendar: Arc::new(SqlCropCalendar::new(catalog.clone())),
        weather: Arc::new(CsvWeatherSource::new(&config.weather_dir)),
        soil: Arc::new(UniformSoil::default()),
        simulator: Arc::new(PhenologyModel),
    };
    Arc::new(TaskRunner::new(catalog, deps))
}

/// Flip the returned flag on Ctrl-C or SIGTERM.
fn shutdown_flag() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
    });
    rx
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

async fn supervise(config: &Config, cpus: Option<i64>, scan_crops: Vec<i64>) -> anyhow::Result<u8> {
    let (slots, queue) = if scan_crops.is_empty() {
        let count = worker_count(cpus.or(config.supervisor.cpus), available_parallelism());
        let command = WorkerCommand::current_exe(["work"])?;
        let queue = TaskQueue::new(open_db(config).await?);
        (vec![command; count], Some(queue))
    } else {
        let slots = scan_crops
            .iter()
            .map(|crop| WorkerCommand::current_exe(["scan".to_string(), "--crop".to_string(), crop.to_string()]))
            .collect::<Result<Vec<_>, _>>()?;
        (slots, None)
    };

    eprintln!("gridbatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Workers: {}", slots.len());
    eprintln!("   Staging: {}\n", config.staging_dir.display());

    let mut supervisor = Supervisor::new(slots, &config.supervisor);
    if let Some(queue) = queue {
        supervisor = supervisor.with_queue(queue);
    }
    let report = supervisor.run(shutdown_signal()).await?;
    Ok(if report.shutdown { EXIT_INTERRUPTED } else { 0 })
}

async fn work(config: &Config, direct: bool) -> anyhow::Result<u8> {
    let db = open_db(config).await?;
    let queue = TaskQueue::new(db.clone());
    let runner = build_runner(config, Catalog::new(db));

    let store = if direct {
        Some(Arc::new(Mutex::new(
            ArtifactStore::open(&config.store_dir, config.store_max_keys).await?,
        )))
    } else {
        None
    };
    let sink: Arc<dyn ArtifactSink> = match &store {
        Some(store) => store.clone(),
        None => Arc::new(StagingDir::open(&config.staging_dir).await?),
    };

    let outcome = WorkerLoop::new(queue, runner, sink, config.worker.clone(), shutdown_flag())
        .run()
        .await;
    if let Some(store) = store {
        store.lock().await.close().await?;
    }
    let report = outcome?;
    Ok(u8::try_from(report.exit.exit_code()).unwrap_or(EXIT_FATAL))
}

async fn scan(config: &Config, crop: i64) -> anyhow::Result<u8> {
    let db = open_db(config).await?;
    let runner = build_runner(config, Catalog::new(db));
    let scanner = GridScanner::new(runner, RegularGrid::new(config.grid), config.worker.scan_field.clone());
    let report = scanner.scan(crop, &shutdown_flag()).await?;
    Ok(if report.interrupted { EXIT_INTERRUPTED } else { 0 })
}

async fn ingest_loop(config: &Config, once: bool, cleanup: bool) -> anyhow::Result<u8> {
    let staging = StagingDir::open(&config.staging_dir).await?;
    let mut store = ArtifactStore::open(&config.store_dir, config.store_max_keys).await?;
    let mut shutdown = shutdown_flag();
    let mut code = 0;

    loop {
        ingest(&staging, &mut store, cleanup).await?;
        if once {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(INGEST_INTERVAL) => {}
            _ = shutdown.changed() => {
                code = EXIT_INTERRUPTED;
                break;
            }
        }
    }
    store.close().await?;
    Ok(code)
}
