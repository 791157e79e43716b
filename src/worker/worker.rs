//! Worker loop: lease jobs, run their handlers, report the outcome.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::WorkerConfig;
use crate::error::JobError;
use crate::job::context::JobContext;
use crate::job::handler::JobHandler;
use crate::job::model::{FailOutcome, Job, JobFailure};
use crate::job::registry::JobRegistry;
use crate::store::Database;
use crate::store::traits::Broker;

/// Shared dependencies for workers.
#[derive(Clone)]
pub struct WorkerDeps {
    pub db: Arc<dyn Database>,
    pub registry: Arc<JobRegistry>,
    pub config: WorkerConfig,
}

/// Outcome counters, shared by every worker of a pool.
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead: AtomicU64,
    lease_lost: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead: u64,
    pub lease_lost: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead: self.dead.load(Ordering::Relaxed),
            lease_lost: self.lease_lost.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: Outcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Succeeded => &self.succeeded,
            Outcome::Retrying => &self.retried,
            Outcome::Dead => &self.dead,
            Outcome::LeaseLost => &self.lease_lost,
            Outcome::Unsettled => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What happened to one leased job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Retrying,
    Dead,
    /// Another worker or the reaper took the job; our result was discarded.
    LeaseLost,
    /// The result could not be written; the lease will expire and the job
    /// will be retried.
    Unsettled,
}

/// Result of running a handler under its timeout and heartbeat.
enum Execution {
    Completed(serde_json::Value),
    Failed(JobFailure),
    LeaseLost,
}

/// A single job-processing agent.
pub struct Worker {
    id: String,
    deps: WorkerDeps,
    stats: Arc<WorkerStats>,
}

impl Worker {
    pub fn new(id: impl Into<String>, deps: WorkerDeps) -> Self {
        Self::with_stats(id, deps, Arc::new(WorkerStats::default()))
    }

    pub fn with_stats(id: impl Into<String>, deps: WorkerDeps, stats: Arc<WorkerStats>) -> Self {
        Self {
            id: id.into(),
            deps,
            stats,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    fn db(&self) -> &Arc<dyn Database> {
        &self.deps.db
    }

    /// Run until `shutdown` flips to `true`. In-flight jobs finish first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let config = &self.deps.config;
        let mut retry_delay = config.broker_retry_delay;
        tracing::info!(worker = %self.id, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.run_once().await {
                Ok(0) => config.poll_interval,
                Ok(_) => {
                    retry_delay = config.broker_retry_delay;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        worker = %self.id,
                        error = %e,
                        retry_in = ?retry_delay,
                        "Broker unavailable, backing off"
                    );
                    let pause = retry_delay;
                    retry_delay = (retry_delay * 2).min(config.broker_retry_max_delay);
                    pause
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(worker = %self.id, "Worker stopped");
    }

    /// Lease one batch and process it. Returns how many jobs were leased.
    pub async fn run_once(&self) -> Result<usize, JobError> {
        let jobs = self
            .db()
            .dequeue(&self.id, self.deps.config.batch_size, Utc::now())
            .await?;
        let count = jobs.len();
        self.process_batch(jobs).await;
        Ok(count)
    }

    /// Run leased jobs one after another. Jobs still waiting their turn have
    /// their leases renewed by the heartbeat of the job in front of them.
    pub async fn process_batch(&self, jobs: Vec<Job>) {
        let mut waiting: VecDeque<Job> = jobs.into();
        while let Some(job) = waiting.pop_front() {
            let outcome = self.process_leased(job, waiting.make_contiguous()).await;
            self.stats.record(outcome);
        }
    }

    /// Run one leased job to a settled outcome.
    pub async fn process(&self, job: Job) -> Outcome {
        self.process_leased(job, &[]).await
    }

    async fn process_leased(&self, job: Job, waiting: &[Job]) -> Outcome {
        // The lease may have been reclaimed while earlier batch jobs ran
        match self
            .db()
            .extend_lease(job.id, &self.id, job.visibility_timeout, Utc::now())
            .await
        {
            Ok(_) => {}
            Err(e) if is_lease_lost(&e) => {
                tracing::warn!(job_id = %job.id, worker = %self.id, "Lease lost before start, skipping job");
                return Outcome::LeaseLost;
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Could not renew lease before start");
            }
        }

        let Some(registered) = self.deps.registry.get(&job.job_type).await else {
            tracing::error!(job_id = %job.id, job_type = %job.job_type, "No handler registered");
            let failure = JobFailure::unknown_job_type(&job.job_type);
            return match self.db().mark_dead(job.id, &self.id, failure, Utc::now()).await {
                Ok(()) => Outcome::Dead,
                Err(e) => self.unsettled(&job, e),
            };
        };

        tracing::debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.current_attempt(),
            timeout = ?job.timeout,
            worker = %self.id,
            "Executing job"
        );

        match self.execute(&job, registered.handler, waiting).await {
            Execution::Completed(output) => {
                match self.db().ack(job.id, &self.id, output, Utc::now()).await {
                    Ok(true) => {
                        tracing::info!(job_id = %job.id, job_type = %job.job_type, "Job succeeded");
                        Outcome::Succeeded
                    }
                    Ok(false) => Outcome::LeaseLost,
                    Err(e) => self.unsettled(&job, e),
                }
            }
            Execution::Failed(failure) => {
                tracing::warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.current_attempt(),
                    error = %failure,
                    "Job attempt failed"
                );
                match self.db().fail(job.id, &self.id, failure, Utc::now()).await {
                    Ok(FailOutcome::Retrying { run_at, .. }) => {
                        tracing::info!(job_id = %job.id, retry_at = %run_at, "Job scheduled for retry");
                        Outcome::Retrying
                    }
                    Ok(FailOutcome::Dead { attempts }) => {
                        tracing::error!(job_id = %job.id, job_type = %job.job_type, attempts, "Job is dead");
                        Outcome::Dead
                    }
                    Err(e) => self.unsettled(&job, e),
                }
            }
            Execution::LeaseLost => Outcome::LeaseLost,
        }
    }

    fn unsettled(&self, job: &Job, error: JobError) -> Outcome {
        if is_lease_lost(&error) {
            tracing::info!(job_id = %job.id, worker = %self.id, "Lease lost, result discarded");
            return Outcome::LeaseLost;
        }
        tracing::error!(
            job_id = %job.id,
            worker = %self.id,
            error = %error,
            "Could not record job outcome; it will be retried after the lease expires"
        );
        Outcome::Unsettled
    }

    /// Run the handler in its own task under the job's declared timeout so a
    /// panic or a hang cannot take the worker down. The heartbeat renews the
    /// running job's lease and those of `waiting`.
    async fn execute(&self, job: &Job, handler: Arc<dyn JobHandler>, waiting: &[Job]) -> Execution {
        let timeout = job.timeout;
        let ctx = JobContext::for_job(job, &self.id, self.db().clone());
        let payload = job.payload.clone();
        let mut task = tokio::spawn(async move { handler.execute(ctx, payload).await });

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let beat_every = waiting
            .iter()
            .map(|w| w.visibility_timeout)
            .fold(job.visibility_timeout, Duration::min)
            / 2;
        let beat_every = beat_every.max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + beat_every, beat_every);

        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(Ok(output)) => Execution::Completed(output),
                        Ok(Err(e)) => Execution::Failed(JobFailure::exception(format!("{e:#}"))),
                        Err(e) if e.is_panic() => Execution::Failed(JobFailure::exception(
                            format!("handler panicked: {}", panic_message(e.into_panic())),
                        )),
                        Err(e) => Execution::Failed(JobFailure::exception(format!("handler task failed: {e}"))),
                    };
                }
                _ = &mut deadline => {
                    task.abort();
                    return Execution::Failed(JobFailure::timeout(timeout));
                }
                _ = heartbeat.tick() => {
                    let now = Utc::now();
                    match self.db().extend_lease(job.id, &self.id, job.visibility_timeout, now).await {
                        Ok(_) => {}
                        Err(e) if is_lease_lost(&e) => {
                            tracing::warn!(job_id = %job.id, worker = %self.id, "Lease lost while running, aborting handler");
                            task.abort();
                            return Execution::LeaseLost;
                        }
                        Err(e) => {
                            tracing::warn!(job_id = %job.id, error = %e, "Lease heartbeat failed");
                        }
                    }
                    for next in waiting {
                        if let Err(e) = self.db().extend_lease(next.id, &self.id, next.visibility_timeout, now).await {
                            tracing::debug!(job_id = %next.id, error = %e, "Could not renew lease of waiting job");
                        }
                    }
                }
            }
        }
    }
}

/// Errors meaning this worker no longer owns the job.
fn is_lease_lost(error: &JobError) -> bool {
    matches!(
        error,
        JobError::LeaseConflict { .. } | JobError::InvalidTransition { .. } | JobError::NotFound { .. }
    )
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
