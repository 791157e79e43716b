use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use beatq::beat::{Beat, spawn_beat};
use beatq::config::Settings;
use beatq::job::builtin::register_builtins;
use beatq::job::{JobId, JobQueue, JobRegistry, SubmitOptions};
use beatq::store::{Database, LibSqlBackend};
use beatq::worker::{WorkerDeps, WorkerPool};

const USAGE: &str = "usage: beatq <worker | beat | all | submit <job_type> [json] | status <job_id>>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(settings.log_dir.as_deref());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("all");

    // ── Database ─────────────────────────────────────────────────────────
    let backend = LibSqlBackend::from_config(&settings.database)
        .await
        .with_context(|| format!("Failed to open database at {}", settings.database.path.display()))?
        .with_backoff(settings.backoff.clone());
    let db: Arc<dyn Database> = Arc::new(backend);

    // ── Registry ─────────────────────────────────────────────────────────
    let registry = Arc::new(JobRegistry::with_defaults(settings.job_defaults.clone()));
    register_builtins(&registry, settings.beat.retention).await;
    let queue = JobQueue::new(db.clone(), registry.clone());

    match command {
        "worker" => run(&settings, db, registry, queue, true, false).await,
        "beat" => run(&settings, db, registry, queue, false, true).await,
        "all" => run(&settings, db, registry, queue, true, true).await,
        "submit" => {
            let job_type = args.get(1).context(USAGE)?;
            let payload = match args.get(2) {
                Some(raw) => serde_json::from_str(raw).context("Payload is not valid JSON")?,
                None => serde_json::Value::Null,
            };
            let id = queue.submit(job_type, payload, SubmitOptions::default()).await?;
            println!("{id}");
            Ok(())
        }
        "status" => {
            let raw = args.get(1).context(USAGE)?;
            let id: JobId = raw.parse().with_context(|| format!("Invalid job id: {raw}"))?;
            match queue.get_status(id).await? {
                Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
                None => bail!("Job {id} not found"),
            }
            Ok(())
        }
        other => bail!("Unknown command {other:?}\n{USAGE}"),
    }
}

/// Run the worker pool and/or beat until Ctrl-C.
async fn run(
    settings: &Settings,
    db: Arc<dyn Database>,
    registry: Arc<JobRegistry>,
    queue: JobQueue,
    with_workers: bool,
    with_beat: bool,
) -> anyhow::Result<()> {
    eprintln!("beatq v{}", env!("CARGO_PKG_VERSION"));
    match &settings.database.remote_url {
        Some(url) => eprintln!("   Database: {url}"),
        None => eprintln!("   Database: {}", settings.database.path.display()),
    }
    eprintln!("   Job types: {}", registry.list().await.join(", "));

    let pool = with_workers.then(|| {
        eprintln!(
            "   Workers: {} (batch {})",
            settings.worker.concurrency, settings.worker.batch_size
        );
        WorkerPool::spawn(WorkerDeps {
            db: db.clone(),
            registry: registry.clone(),
            config: settings.worker.clone(),
        })
    });

    let (beat_shutdown, beat_rx) = watch::channel(false);
    let beat_task = if with_beat {
        let beat = Arc::new(Beat::new(queue, settings.beat.clone()));
        let entries = beat.register_configured().await?;
        eprintln!("   Beat: {} ({} entries)", beat.instance_id(), entries.len());
        Some(spawn_beat(beat, beat_rx))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");

    let _ = beat_shutdown.send(true);
    if let Some(task) = beat_task
        && let Err(e) = task.await
    {
        tracing::error!("Beat task failed: {e}");
    }
    if let Some(pool) = pool {
        pool.shutdown().await;
    }

    Ok(())
}

/// Stdout logging, plus a daily-rolling file when `log_dir` is set. The
/// returned guard flushes the file writer on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout = tracing_subscriber::fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "beatq.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stdout).init();
            None
        }
    }
}
