//! Worker pool: N workers sharing one broker.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::worker::worker::{Worker, WorkerDeps, WorkerStats, WorkerStatsSnapshot};

/// Spawns workers as tokio tasks.
pub struct WorkerPool;

impl WorkerPool {
    /// Start `deps.config.concurrency` workers named `<prefix>-<n>`.
    pub fn spawn(deps: WorkerDeps) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(WorkerStats::default());
        let concurrency = deps.config.concurrency.max(1);

        let mut worker_ids = Vec::with_capacity(concurrency);
        let mut handles = Vec::with_capacity(concurrency);
        for n in 1..=concurrency {
            let id = format!("{}-{n}", deps.config.id_prefix);
            let worker = Worker::with_stats(id.clone(), deps.clone(), stats.clone());
            let rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move { worker.run(rx).await }));
            worker_ids.push(id);
        }

        tracing::info!(
            workers = concurrency,
            batch_size = deps.config.batch_size,
            "Worker pool started"
        );

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            handles,
            stats,
            worker_ids,
        }
    }
}

/// Handle to a running pool.
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
    worker_ids: Vec<String>,
}

impl WorkerPoolHandle {
    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn worker_ids(&self) -> &[String] {
        &self.worker_ids
    }

    /// Stop dequeuing and wait for in-flight jobs to finish.
    pub async fn shutdown(self) -> WorkerStatsSnapshot {
        let _ = self.shutdown.send(true);
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                tracing::error!("Worker task failed: {e}");
            }
        }
        let stats = self.stats.snapshot();
        tracing::info!(?stats, "Worker pool stopped");
        stats
    }
}
