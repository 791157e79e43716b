//! Built-in job types.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::job::context::JobContext;
use crate::job::handler::{TypedJob, typed};
use crate::job::registry::{JobPolicy, JobRegistry};
use crate::store::traits::ResultStore;

/// Job type of the retention sweep.
pub const PURGE_FINISHED: &str = "beatq.purge_finished";

/// Deletes succeeded and cancelled jobs older than the retention period.
pub struct PurgeFinished {
    pub retention: Duration,
}

#[derive(Debug, Default, Deserialize)]
pub struct PurgeRequest {
    /// Overrides the configured retention for this run.
    #[serde(default)]
    pub older_than_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct PurgeReport {
    pub purged: usize,
    pub cutoff: chrono::DateTime<Utc>,
}

#[async_trait]
impl TypedJob for PurgeFinished {
    type Payload = PurgeRequest;
    type Output = PurgeReport;

    async fn run(&self, ctx: JobContext, req: PurgeRequest) -> anyhow::Result<PurgeReport> {
        let retention = req
            .older_than_secs
            .map(Duration::from_secs)
            .unwrap_or(self.retention);
        let cutoff = Utc::now() - chrono::Duration::from_std(retention)?;
        let purged = ctx.store().purge_finished(cutoff).await?;
        tracing::info!(purged, cutoff = %cutoff, "Retention sweep finished");
        Ok(PurgeReport { purged, cutoff })
    }
}

/// Register the built-in job types.
pub async fn register_builtins(registry: &JobRegistry, retention: Option<Duration>) {
    if let Some(retention) = retention {
        registry
            .register(
                PURGE_FINISHED,
                typed(PurgeFinished { retention }),
                JobPolicy::default()
                    .with_max_attempts(1)
                    .with_priority(-10),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::model::{JobId, NewJob};
    use crate::store::LibSqlBackend;
    use crate::store::traits::Broker;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn purge_handler_removes_old_succeeded_jobs() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let then = Utc::now() - chrono::Duration::days(10);

        let mut job = NewJob::new("report", json!({}), &JobPolicy::default());
        job.enqueued_at = then;
        job.run_at = then;
        let id = db.enqueue(job).await.unwrap();
        db.dequeue("w1", 1, then).await.unwrap();
        db.ack(id, "w1", json!("done"), then).await.unwrap();

        let registry = JobRegistry::new();
        register_builtins(&registry, Some(Duration::from_secs(86_400))).await;
        let handler = registry.get(PURGE_FINISHED).await.unwrap().handler;

        let out = handler
            .execute(JobContext::detached(JobId::new(), PURGE_FINISHED, db.clone()), json!({}))
            .await
            .unwrap();
        assert_eq!(out["purged"], json!(1));
        assert!(db.get_job(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_retention_means_no_purge_job() {
        let registry = JobRegistry::new();
        register_builtins(&registry, None).await;
        assert!(!registry.has(PURGE_FINISHED).await);
    }
}
