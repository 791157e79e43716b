//! Storage traits for the broker, result store, schedule table and leader lock.
//!
//! Every method that changes a job is a single compare-and-set statement
//! keyed on the state (and lease owner) the caller expects, so two workers,
//! or a worker and the lease reaper, can never both win the same transition.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::beat::entry::ScheduleEntry;
use crate::error::{DatabaseError, JobError};
use crate::job::model::{
    AttemptRecord, FailOutcome, Job, JobFailure, JobId, JobState, JobStatus, NewJob, QueueStats,
    TimeRange,
};

/// Durable priority/FIFO queue with leases.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Store a new job. Never waits for execution.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobError>;

    /// Reclaim expired leases, then lease up to `batch_size` eligible jobs to
    /// `worker_id`, highest priority first and FIFO within a priority.
    async fn dequeue(
        &self,
        worker_id: &str,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobError>;

    /// Mark a leased job succeeded. Returns `false` if the job was already
    /// terminal, so a repeated ack is a no-op.
    async fn ack(
        &self,
        id: JobId,
        worker_id: &str,
        output: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, JobError>;

    /// Record a failed attempt and either schedule a retry or mark the job dead.
    async fn fail(
        &self,
        id: JobId,
        worker_id: &str,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobError>;

    /// Record a fatal failure. No retry.
    async fn mark_dead(
        &self,
        id: JobId,
        worker_id: &str,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> Result<(), JobError>;

    /// Push the lease expiry to `now + extend_by`. Returns the new expiry.
    async fn extend_lease(
        &self,
        id: JobId,
        worker_id: &str,
        extend_by: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, JobError>;

    /// Cancel a job that has not been leased yet.
    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, JobError>;

    /// Put a dead job back in the queue with a fresh attempt budget.
    async fn requeue_dead(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, JobError>;

    /// Treat every lease that expired before `now` as a failed attempt.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, JobError>;

    /// Number of jobs waiting to run (pending or retrying).
    async fn queue_depth(&self) -> Result<u64, JobError>;

    /// Job counts per state.
    async fn stats(&self) -> Result<QueueStats, JobError>;
}

/// Per-job status and attempt history.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, DatabaseError>;

    async fn get_status(&self, id: JobId) -> Result<Option<JobStatus>, DatabaseError> {
        Ok(self.get_job(id).await?.map(JobStatus::from))
    }

    /// Jobs of `job_type` in `state` whose last update falls within `range`,
    /// most recent first.
    async fn list_by_type_and_state(
        &self,
        job_type: &str,
        state: JobState,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Finished attempts of a job, oldest first.
    async fn list_attempts(&self, id: JobId) -> Result<Vec<AttemptRecord>, DatabaseError>;

    /// Store progress metadata on a running job.
    async fn set_progress(
        &self,
        id: JobId,
        progress: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Delete succeeded and cancelled jobs finished before `older_than`.
    /// Dead jobs are kept.
    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<usize, DatabaseError>;
}

/// Beat's schedule table.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn upsert_entry(&self, entry: &ScheduleEntry) -> Result<(), DatabaseError>;

    async fn get_entry(&self, name: &str) -> Result<Option<ScheduleEntry>, DatabaseError>;

    async fn list_entries(&self) -> Result<Vec<ScheduleEntry>, DatabaseError>;

    /// Enabled entries with `next_fire_at <= now`.
    async fn list_due_entries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleEntry>, DatabaseError>;

    /// Move `next_fire_at` from `expected_next` to `next`. Returns `false` if
    /// someone else already advanced the entry.
    async fn advance_entry(
        &self,
        name: &str,
        expected_next: DateTime<Utc>,
        next: DateTime<Utc>,
        fired_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError>;

    async fn set_entry_enabled(&self, name: &str, enabled: bool) -> Result<bool, DatabaseError>;

    async fn delete_entry(&self, name: &str) -> Result<bool, DatabaseError>;
}

/// Named lock with a TTL, used to elect a single beat instance.
#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Take or renew the lock. Succeeds if the lock is free, expired, or
    /// already held by `holder`.
    async fn try_acquire_lock(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn release_lock(&self, name: &str, holder: &str) -> Result<bool, DatabaseError>;

    /// Current unexpired holder, if any.
    async fn lock_holder(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, DatabaseError>;
}

/// Everything a beatq process needs from its database.
pub trait Database: Broker + ResultStore + ScheduleStore + LeaderLock {}

impl<T: Broker + ResultStore + ScheduleStore + LeaderLock> Database for T {}
