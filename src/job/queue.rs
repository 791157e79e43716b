//! Producer API: submit jobs and read their status.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::JobError;
use crate::job::model::{
    AttemptRecord, Job, JobId, JobState, JobStatus, NewJob, QueueStats, TimeRange,
};
use crate::job::registry::JobRegistry;
use crate::store::Database;
use crate::store::traits::{Broker, ResultStore};

/// Per-submission overrides of the job type's policy.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: Option<i32>,
    /// Run no earlier than this long after submission.
    pub delay: Option<Duration>,
    /// Run no earlier than this time. Takes precedence over `delay`.
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
    /// Handler time limit for this job. Workers enforce the value stored
    /// with the job, not their own registry's.
    pub timeout: Option<Duration>,
}

impl SubmitOptions {
    pub fn priority(priority: i32) -> Self {
        Self {
            priority: Some(priority),
            ..Default::default()
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }
}

/// Front door for producers (HTTP handlers, scripts, beat).
#[derive(Clone)]
pub struct JobQueue {
    db: Arc<dyn Database>,
    registry: Arc<JobRegistry>,
}

impl JobQueue {
    pub fn new(db: Arc<dyn Database>, registry: Arc<JobRegistry>) -> Self {
        Self { db, registry }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Enqueue a job and return its id without waiting for execution.
    ///
    /// Unregistered job types are accepted; a worker marks them dead with
    /// `UnknownJobType` when it picks them up.
    pub async fn submit(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        opts: SubmitOptions,
    ) -> Result<JobId, JobError> {
        let policy = self.registry.policy_for(job_type).await;
        let mut job = NewJob::new(job_type, payload, &policy);
        if let Some(priority) = opts.priority {
            job = job.with_priority(priority);
        }
        if let Some(max_attempts) = opts.max_attempts {
            job = job.with_max_attempts(max_attempts);
        }
        if let Some(timeout) = opts.timeout {
            job.timeout = timeout;
        }
        if let Some(run_at) = opts.run_at {
            job = job.run_at(run_at);
        } else if let Some(delay) = opts.delay {
            job = job.delayed(delay);
        }

        if !self.registry.has(job_type).await {
            tracing::warn!(job_type = %job_type, "Submitting job with no registered handler");
        }
        self.db.enqueue(job).await
    }

    /// Current status of a job, or `None` if it does not exist (or was purged).
    pub async fn get_status(&self, id: JobId) -> Result<Option<JobStatus>, JobError> {
        Ok(self.db.get_status(id).await?)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, JobError> {
        Ok(self.db.get_job(id).await?)
    }

    /// Cancel a job that has not started. Running jobs are not interrupted.
    pub async fn cancel(&self, id: JobId) -> Result<bool, JobError> {
        self.db.cancel(id, Utc::now()).await
    }

    pub async fn requeue_dead(&self, id: JobId) -> Result<bool, JobError> {
        self.db.requeue_dead(id, Utc::now()).await
    }

    pub async fn list_by_type_and_state(
        &self,
        job_type: &str,
        state: JobState,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<Job>, JobError> {
        Ok(self
            .db
            .list_by_type_and_state(job_type, state, range, limit)
            .await?)
    }

    pub async fn list_attempts(&self, id: JobId) -> Result<Vec<AttemptRecord>, JobError> {
        Ok(self.db.list_attempts(id).await?)
    }

    pub async fn stats(&self) -> Result<QueueStats, JobError> {
        self.db.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::handler::handler_fn;
    use crate::job::registry::JobPolicy;
    use crate::store::LibSqlBackend;
    use serde_json::json;

    async fn queue() -> JobQueue {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let registry = Arc::new(JobRegistry::new());
        registry
            .register(
                "thumbnail",
                handler_fn(|_ctx, _p| async { Ok(json!(null)) }),
                JobPolicy::default().with_max_attempts(5).with_priority(4),
            )
            .await;
        JobQueue::new(db, registry)
    }

    #[tokio::test]
    async fn submit_uses_registered_policy() {
        let queue = queue().await;
        let id = queue
            .submit("thumbnail", json!({"w": 64}), SubmitOptions::default())
            .await
            .unwrap();

        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.priority, 4);
        assert_eq!(job.payload, json!({"w": 64}));
    }

    #[tokio::test]
    async fn submit_overrides() {
        let queue = queue().await;
        let id = queue
            .submit(
                "thumbnail",
                json!({}),
                SubmitOptions {
                    priority: Some(-1),
                    delay: Some(Duration::from_secs(120)),
                    max_attempts: Some(1),
                    timeout: Some(Duration::from_secs(5)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.priority, -1);
        assert_eq!(job.max_attempts, 1);
        assert_eq!(job.timeout, Duration::from_secs(5));
        assert!(job.run_at >= job.enqueued_at + chrono::Duration::seconds(119));
    }

    #[tokio::test]
    async fn submit_unknown_type_is_accepted() {
        let queue = queue().await;
        let id = queue
            .submit("send_email", json!({"to": "a@b.c"}), SubmitOptions::default())
            .await
            .unwrap();
        let status = queue.get_status(id).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Pending);
        assert_eq!(status.max_attempts, 3);
    }

    #[tokio::test]
    async fn cancel_and_stats() {
        let queue = queue().await;
        let id = queue
            .submit("thumbnail", json!({}), SubmitOptions::default())
            .await
            .unwrap();
        assert!(queue.cancel(id).await.unwrap());
        assert!(!queue.cancel(id).await.unwrap());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.pending, 0);
    }
}
