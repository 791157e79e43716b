//! Per-attempt context handed to job handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::job::model::{Job, JobId};
use crate::store::Database;
use crate::store::traits::ResultStore;

/// Context for a running job attempt.
#[derive(Clone)]
pub struct JobContext {
    /// Unique job ID.
    pub job_id: JobId,
    pub job_type: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Worker holding the lease.
    pub worker_id: String,
    pub enqueued_at: DateTime<Utc>,
    store: Arc<dyn Database>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

impl JobContext {
    /// Context for an attempt of `job` leased by `worker_id`.
    pub fn for_job(job: &Job, worker_id: &str, store: Arc<dyn Database>) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempt: job.current_attempt(),
            max_attempts: job.max_attempts,
            worker_id: worker_id.to_string(),
            enqueued_at: job.enqueued_at,
            store,
        }
    }

    /// Context that is not tied to a leased job, for running a handler
    /// directly.
    pub fn detached(job_id: JobId, job_type: &str, store: Arc<dyn Database>) -> Self {
        Self {
            job_id,
            job_type: job_type.to_string(),
            attempt: 1,
            max_attempts: 1,
            worker_id: "detached".to_string(),
            enqueued_at: Utc::now(),
            store,
        }
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Persist progress metadata on the job row so producers can see it
    /// through `get_status`. Ignored once the attempt is no longer running.
    pub async fn report_progress(&self, meta: serde_json::Value) -> Result<(), DatabaseError> {
        let applied = self.store.set_progress(self.job_id, &meta, Utc::now()).await?;
        if !applied {
            tracing::debug!(job_id = %self.job_id, "Progress dropped, job not running");
        }
        Ok(())
    }

    /// The store this attempt runs against.
    pub fn store(&self) -> &Arc<dyn Database> {
        &self.store
    }
}
