//! libSQL backend: async implementation of every storage trait.
//!
//! Supports local file, in-memory and remote (sqld / Turso) databases. Jobs,
//! attempts, schedule entries and leader locks all live in one database so a
//! worker and a beat process only need to agree on its location.

use std::cmp::Reverse;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::beat::entry::ScheduleEntry;
use crate::config::DatabaseConfig;
use crate::error::{DatabaseError, JobError};
use crate::job::backoff::BackoffPolicy;
use crate::job::model::{
    AttemptRecord, FailOutcome, FailureKind, Job, JobFailure, JobId, JobState, Lease, NewJob,
    QueueStats, TimeRange,
};
use crate::store::migrations;
use crate::store::traits::{Broker, LeaderLock, ResultStore, ScheduleStore};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    backoff: BackoffPolicy,
}

impl LibSqlBackend {
    /// Open the database described by `config`: remote when a URL is set,
    /// otherwise the local file.
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        match (&config.remote_url, &config.auth_token) {
            (Some(url), Some(token)) => {
                Self::new_remote(url, token.expose_secret().to_string()).await
            }
            (Some(url), None) => Self::new_remote(url, String::new()).await,
            (None, _) => Self::new_local(&config.path).await,
        }
    }

    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            backoff: BackoffPolicy::default(),
        };
        backend.pragma("PRAGMA journal_mode = WAL").await;
        backend.pragma("PRAGMA busy_timeout = 5000").await;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            backoff: BackoffPolicy::default(),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Connect to a remote libSQL server.
    pub async fn new_remote(url: &str, auth_token: String) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_remote(url.to_string(), auth_token)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to connect to {url}: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            backoff: BackoffPolicy::default(),
        };
        backend.init_schema().await?;
        info!(url = %url, "Remote database connected");
        Ok(backend)
    }

    /// Retry delay policy used by `fail` and lease reclaim.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Run all pending schema migrations.
    pub async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn pragma(&self, sql: &str) {
        if let Err(e) = self.conn.query(sql, ()).await {
            debug!(pragma = sql, "Pragma not applied: {e}");
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn opt_millis(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Integer(to_millis(dt)),
        None => libsql::Value::Null,
    }
}

fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_integer(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

fn to_json(value: &serde_json::Value) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Stored JSON that no longer parses is surfaced as a plain string.
fn parse_json(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.to_string()))
}

fn col_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

fn parse_failure(kind: Option<String>, message: Option<String>) -> Option<JobFailure> {
    let message = message?;
    let kind = kind
        .and_then(|k| k.parse().ok())
        .unwrap_or(FailureKind::HandlerException);
    Some(JobFailure { kind, message })
}

const JOB_COLUMNS: &str = "seq, id, job_type, payload, priority, state, attempt_count, max_attempts, timeout_ms, visibility_timeout_ms, enqueued_at, run_at, lease_owner, lease_expires_at, started_at, output, error_kind, error, progress, updated_at, finished_at";

const ATTEMPT_COLUMNS: &str =
    "job_id, attempt, worker_id, state, output, error_kind, error, started_at, finished_at";

const ENTRY_COLUMNS: &str = "name, job_type, payload, priority, cadence, enabled, next_fire_at, last_fired_at, created_at, updated_at";

/// Map a libsql Row to a Job.
///
/// Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id_str: String = row.get(1).map_err(col_err)?;
    let id: JobId = id_str
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("invalid job id {id_str}: {e}")))?;
    let state_str: String = row.get(5).map_err(col_err)?;
    let state: JobState = state_str.parse().map_err(DatabaseError::Serialization)?;

    let lease_owner: Option<String> = row.get::<String>(12).ok();
    let lease_expires_at: Option<i64> = row.get::<i64>(13).ok();
    let lease = match (state, lease_owner, lease_expires_at) {
        (JobState::Running, Some(worker_id), Some(expires)) => Some(Lease {
            worker_id,
            expires_at: from_millis(expires),
        }),
        _ => None,
    };

    let payload: String = row.get(3).map_err(col_err)?;

    Ok(Job {
        seq: row.get(0).map_err(col_err)?,
        id,
        job_type: row.get(2).map_err(col_err)?,
        payload: parse_json(&payload),
        priority: row.get::<i64>(4).map_err(col_err)? as i32,
        state,
        attempt_count: row.get::<i64>(6).map_err(col_err)? as u32,
        max_attempts: row.get::<i64>(7).map_err(col_err)? as u32,
        timeout: Duration::from_millis(row.get::<i64>(8).map_err(col_err)?.max(0) as u64),
        visibility_timeout: Duration::from_millis(
            row.get::<i64>(9).map_err(col_err)?.max(0) as u64,
        ),
        enqueued_at: from_millis(row.get(10).map_err(col_err)?),
        run_at: from_millis(row.get(11).map_err(col_err)?),
        lease,
        started_at: row.get::<i64>(14).ok().map(from_millis),
        output: row.get::<String>(15).ok().map(|s| parse_json(&s)),
        error: parse_failure(row.get::<String>(16).ok(), row.get::<String>(17).ok()),
        progress: row.get::<String>(18).ok().map(|s| parse_json(&s)),
        updated_at: from_millis(row.get(19).map_err(col_err)?),
        finished_at: row.get::<i64>(20).ok().map(from_millis),
    })
}

/// Column order matches ATTEMPT_COLUMNS.
fn row_to_attempt(row: &libsql::Row) -> Result<AttemptRecord, DatabaseError> {
    let id_str: String = row.get(0).map_err(col_err)?;
    let state_str: String = row.get(3).map_err(col_err)?;
    Ok(AttemptRecord {
        job_id: id_str
            .parse()
            .map_err(|e| DatabaseError::Serialization(format!("invalid job id {id_str}: {e}")))?,
        attempt: row.get::<i64>(1).map_err(col_err)? as u32,
        worker_id: row.get::<String>(2).ok(),
        state: state_str.parse().map_err(DatabaseError::Serialization)?,
        output: row.get::<String>(4).ok().map(|s| parse_json(&s)),
        error: parse_failure(row.get::<String>(5).ok(), row.get::<String>(6).ok()),
        started_at: row.get::<i64>(7).ok().map(from_millis),
        finished_at: from_millis(row.get(8).map_err(col_err)?),
    })
}

/// Column order matches ENTRY_COLUMNS.
fn row_to_entry(row: &libsql::Row) -> Result<ScheduleEntry, DatabaseError> {
    let cadence_str: String = row.get(4).map_err(col_err)?;
    let payload: String = row.get(2).map_err(col_err)?;
    Ok(ScheduleEntry {
        name: row.get(0).map_err(col_err)?,
        job_type: row.get(1).map_err(col_err)?,
        payload: parse_json(&payload),
        priority: row.get::<i64>(3).ok().map(|p| p as i32),
        cadence: cadence_str
            .parse()
            .map_err(|e| DatabaseError::Serialization(format!("{e}")))?,
        enabled: row.get::<i64>(5).map_err(col_err)? != 0,
        next_fire_at: from_millis(row.get(6).map_err(col_err)?),
        last_fired_at: row.get::<i64>(7).ok().map(from_millis),
        created_at: from_millis(row.get(8).map_err(col_err)?),
        updated_at: from_millis(row.get(9).map_err(col_err)?),
    })
}

/// What the failure path needs to know about the attempt being closed.
struct RunningAttempt {
    id: JobId,
    worker_id: String,
    attempt_count: u32,
    max_attempts: u32,
    started_at: Option<DateTime<Utc>>,
}

impl LibSqlBackend {
    async fn insert_attempt(&self, record: &AttemptRecord) -> Result<(), DatabaseError> {
        let output = match &record.output {
            Some(v) => Some(to_json(v)?),
            None => None,
        };
        self.conn()
            .execute(
                "INSERT INTO job_attempts (job_id, attempt, worker_id, state, output, error_kind, error, started_at, finished_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.job_id.to_string(),
                    record.attempt as i64,
                    opt_text(record.worker_id.clone()),
                    record.state.as_str(),
                    opt_text(output),
                    opt_text(record.error.as_ref().map(|e| e.kind.as_str().to_string())),
                    opt_text(record.error.as_ref().map(|e| e.message.clone())),
                    opt_millis(record.started_at),
                    to_millis(record.finished_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_attempt: {e}")))?;
        Ok(())
    }

    /// Close a running attempt as failed. Returns `None` if the job was no
    /// longer leased by `attempt.worker_id` when the update ran. With
    /// `expired_by` set, the lease must also still be expired at that time.
    async fn settle_failure(
        &self,
        attempt: &RunningAttempt,
        failure: &JobFailure,
        fatal: bool,
        expired_by: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<FailOutcome>, DatabaseError> {
        let attempts = attempt.attempt_count + 1;
        let outcome = if fatal || !failure.kind.is_retryable() || attempts >= attempt.max_attempts
        {
            FailOutcome::Dead { attempts }
        } else {
            let delay = self.backoff.delay_for_attempt(attempts);
            FailOutcome::Retrying {
                attempt: attempts,
                run_at: now + chrono::Duration::from_std(delay).unwrap_or_default(),
            }
        };

        let (state, run_at, finished_at) = match outcome {
            FailOutcome::Retrying { run_at, .. } => (JobState::Retrying, Some(run_at), None),
            FailOutcome::Dead { .. } => (JobState::Dead, None, Some(now)),
        };

        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET state = ?1, attempt_count = ?2, run_at = COALESCE(?3, run_at), lease_owner = NULL, lease_expires_at = NULL, error_kind = ?4, error = ?5, updated_at = ?6, finished_at = ?7 WHERE id = ?8 AND state = 'running' AND lease_owner = ?9 AND attempt_count = ?10 AND (?11 IS NULL OR lease_expires_at <= ?11)",
                params![
                    state.as_str(),
                    attempts as i64,
                    opt_millis(run_at),
                    failure.kind.as_str(),
                    failure.message.clone(),
                    to_millis(now),
                    opt_millis(finished_at),
                    attempt.id.to_string(),
                    attempt.worker_id.clone(),
                    attempt.attempt_count as i64,
                    opt_millis(expired_by),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("settle_failure: {e}")))?;

        if changed == 0 {
            return Ok(None);
        }

        self.insert_attempt(&AttemptRecord {
            job_id: attempt.id,
            attempt: attempts,
            worker_id: Some(attempt.worker_id.clone()),
            state: match state {
                JobState::Dead => JobState::Dead,
                _ => JobState::Failed,
            },
            output: None,
            error: Some(failure.clone()),
            started_at: attempt.started_at,
            finished_at: now,
        })
        .await?;

        Ok(Some(outcome))
    }

    /// Explain why a lease-holder-only transition did not apply.
    async fn lease_conflict(
        &self,
        id: JobId,
        worker_id: &str,
        target: JobState,
    ) -> Result<JobError, JobError> {
        match self.get_job(id).await? {
            None => Ok(JobError::NotFound { id }),
            Some(job) if job.state.is_terminal() => Ok(JobError::InvalidTransition {
                id,
                state: job.state.to_string(),
                target: target.to_string(),
            }),
            Some(_) => Ok(JobError::LeaseConflict {
                id,
                worker: worker_id.to_string(),
            }),
        }
    }

    /// Load the running attempt of `id` held by `worker_id`.
    async fn running_attempt(
        &self,
        id: JobId,
        worker_id: &str,
        target: JobState,
    ) -> Result<RunningAttempt, JobError> {
        match self.get_job(id).await? {
            Some(job)
                if job.state == JobState::Running
                    && job.lease.as_ref().is_some_and(|l| l.worker_id == worker_id) =>
            {
                Ok(RunningAttempt {
                    id,
                    worker_id: worker_id.to_string(),
                    attempt_count: job.attempt_count,
                    max_attempts: job.max_attempts,
                    started_at: job.started_at,
                })
            }
            _ => Err(self.lease_conflict(id, worker_id, target).await?),
        }
    }

    async fn close_with_failure(
        &self,
        id: JobId,
        worker_id: &str,
        failure: JobFailure,
        fatal: bool,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobError> {
        let target = if fatal { JobState::Dead } else { JobState::Retrying };
        let attempt = self.running_attempt(id, worker_id, target).await?;
        match self.settle_failure(&attempt, &failure, fatal, None, now).await? {
            Some(outcome) => Ok(outcome),
            None => Err(self.lease_conflict(id, worker_id, target).await?),
        }
    }
}

// ── Broker ──────────────────────────────────────────────────────────

#[async_trait]
impl Broker for LibSqlBackend {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobError> {
        let payload = to_json(&job.payload)?;
        let now = to_millis(Utc::now());
        self.conn()
            .execute(
                "INSERT INTO jobs (id, job_type, payload, priority, state, attempt_count, max_attempts, timeout_ms, visibility_timeout_ms, enqueued_at, run_at, updated_at) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    job.id.to_string(),
                    job.job_type.clone(),
                    payload,
                    job.priority as i64,
                    job.max_attempts as i64,
                    job.timeout.as_millis() as i64,
                    job.visibility_timeout.as_millis() as i64,
                    to_millis(job.enqueued_at),
                    to_millis(job.run_at),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?;

        debug!(job_id = %job.id, job_type = %job.job_type, priority = job.priority, "Job enqueued");
        Ok(job.id)
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let reclaimed = self.reclaim_expired(now).await?;
        if reclaimed > 0 {
            info!(count = reclaimed, "Reclaimed expired leases");
        }

        // A single UPDATE claims the rows, so concurrent callers never share a job
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE jobs SET state = 'running', lease_owner = ?1, lease_expires_at = ?2 + visibility_timeout_ms, started_at = ?2, updated_at = ?2 \
                     WHERE state IN ('pending', 'retrying') AND seq IN (\
                         SELECT seq FROM jobs WHERE state IN ('pending', 'retrying') AND run_at <= ?2 \
                         ORDER BY priority DESC, seq ASC LIMIT ?3) \
                     RETURNING {JOB_COLUMNS}"
                ),
                params![worker_id, to_millis(now), batch_size as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("dequeue: {e}")))?;

        let mut jobs = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => jobs.push(row_to_job(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("dequeue: {e}")).into()),
            }
        }

        // RETURNING order is unspecified
        jobs.sort_by_key(|j| (Reverse(j.priority), j.seq));

        for job in &jobs {
            debug!(job_id = %job.id, job_type = %job.job_type, worker = %worker_id, "Job leased");
        }
        Ok(jobs)
    }

    async fn ack(
        &self,
        id: JobId,
        worker_id: &str,
        output: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, JobError> {
        let output_json = to_json(&output)?;
        let mut rows = self
            .conn()
            .query(
                "UPDATE jobs SET state = 'succeeded', attempt_count = attempt_count + 1, output = ?1, lease_owner = NULL, lease_expires_at = NULL, error_kind = NULL, error = NULL, updated_at = ?2, finished_at = ?2 \
                 WHERE id = ?3 AND state = 'running' AND lease_owner = ?4 \
                 RETURNING attempt_count, started_at",
                params![output_json, to_millis(now), id.to_string(), worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ack: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("ack: {e}")))?;

        let Some(row) = row else {
            return match self.get_job(id).await? {
                None => Err(JobError::NotFound { id }),
                Some(job) if job.state.is_terminal() => {
                    debug!(job_id = %id, state = %job.state, "Ack ignored, job already terminal");
                    Ok(false)
                }
                Some(_) => Err(JobError::LeaseConflict {
                    id,
                    worker: worker_id.to_string(),
                }),
            };
        };

        let attempt_count: i64 = row.get(0).map_err(col_err)?;
        let started_at = row.get::<i64>(1).ok().map(from_millis);
        drop(rows);

        self.insert_attempt(&AttemptRecord {
            job_id: id,
            attempt: attempt_count as u32,
            worker_id: Some(worker_id.to_string()),
            state: JobState::Succeeded,
            output: Some(output),
            error: None,
            started_at,
            finished_at: now,
        })
        .await?;

        debug!(job_id = %id, worker = %worker_id, "Job succeeded");
        Ok(true)
    }

    async fn fail(
        &self,
        id: JobId,
        worker_id: &str,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobError> {
        self.close_with_failure(id, worker_id, failure, false, now)
            .await
    }

    async fn mark_dead(
        &self,
        id: JobId,
        worker_id: &str,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        self.close_with_failure(id, worker_id, failure, true, now)
            .await
            .map(|_| ())
    }

    async fn extend_lease(
        &self,
        id: JobId,
        worker_id: &str,
        extend_by: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, JobError> {
        let expires_at = now + chrono::Duration::from_std(extend_by).unwrap_or_default();
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET lease_expires_at = ?1, updated_at = ?2 WHERE id = ?3 AND state = 'running' AND lease_owner = ?4",
                params![to_millis(expires_at), to_millis(now), id.to_string(), worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("extend_lease: {e}")))?;

        if changed == 0 {
            return Err(self.lease_conflict(id, worker_id, JobState::Running).await?);
        }
        Ok(expires_at)
    }

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, JobError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET state = 'cancelled', updated_at = ?1, finished_at = ?1 WHERE id = ?2 AND state IN ('pending', 'retrying')",
                params![to_millis(now), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel: {e}")))?;

        if changed == 0 {
            return match self.get_job(id).await? {
                None => Err(JobError::NotFound { id }),
                Some(_) => Ok(false),
            };
        }
        info!(job_id = %id, "Job cancelled");
        Ok(true)
    }

    async fn requeue_dead(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, JobError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET state = 'pending', attempt_count = 0, run_at = ?1, error_kind = NULL, error = NULL, finished_at = NULL, updated_at = ?1 WHERE id = ?2 AND state = 'dead'",
                params![to_millis(now), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_dead: {e}")))?;

        if changed == 0 {
            return match self.get_job(id).await? {
                None => Err(JobError::NotFound { id }),
                Some(_) => Ok(false),
            };
        }
        info!(job_id = %id, "Dead job requeued");
        Ok(true)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, JobError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, lease_owner, attempt_count, max_attempts, started_at FROM jobs WHERE state = 'running' AND lease_expires_at <= ?1",
                params![to_millis(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reclaim_expired: {e}")))?;

        let mut expired = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row.get(0).map_err(col_err)?;
            let Ok(id) = id_str.parse::<JobId>() else {
                warn!(job_id = %id_str, "Skipping expired lease with invalid id");
                continue;
            };
            expired.push(RunningAttempt {
                id,
                worker_id: row.get::<String>(1).unwrap_or_default(),
                attempt_count: row.get::<i64>(2).map_err(col_err)? as u32,
                max_attempts: row.get::<i64>(3).map_err(col_err)? as u32,
                started_at: row.get::<i64>(4).ok().map(from_millis),
            });
        }
        drop(rows);

        let mut reclaimed = 0;
        for attempt in expired {
            let failure = JobFailure::lease_expired(&attempt.worker_id);
            if let Some(outcome) = self
                .settle_failure(&attempt, &failure, false, Some(now), now)
                .await?
            {
                warn!(
                    job_id = %attempt.id,
                    worker = %attempt.worker_id,
                    outcome = ?outcome,
                    "Lease expired, attempt counted as failed"
                );
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn queue_depth(&self) -> Result<u64, JobError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM jobs WHERE state IN ('pending', 'retrying')",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_depth: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(col_err)?.max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("queue_depth: {e}")).into()),
        }
    }

    async fn stats(&self) -> Result<QueueStats, JobError> {
        let mut rows = self
            .conn()
            .query("SELECT state, COUNT(*) FROM jobs GROUP BY state", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?;

        let mut stats = QueueStats::default();
        while let Ok(Some(row)) = rows.next().await {
            let state: String = row.get(0).map_err(col_err)?;
            let count = row.get::<i64>(1).map_err(col_err)?.max(0) as u64;
            match state.parse::<JobState>() {
                Ok(JobState::Pending) => stats.pending = count,
                Ok(JobState::Running) => stats.running = count,
                Ok(JobState::Succeeded) => stats.succeeded = count,
                Ok(JobState::Retrying) => stats.retrying = count,
                Ok(JobState::Dead) => stats.dead = count,
                Ok(JobState::Cancelled) => stats.cancelled = count,
                Ok(JobState::Failed) | Err(_) => {
                    warn!(state = %state, "Unexpected job state in stats")
                }
            }
        }
        Ok(stats)
    }
}

// ── Result store ────────────────────────────────────────────────────

#[async_trait]
impl ResultStore for LibSqlBackend {
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    async fn list_by_type_and_state(
        &self,
        job_type: &str,
        state: JobState,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE job_type = ?1 AND state = ?2 AND updated_at >= ?3 AND updated_at < ?4 ORDER BY updated_at DESC, seq DESC LIMIT ?5"
                ),
                params![
                    job_type,
                    state.as_str(),
                    to_millis(range.start),
                    to_millis(range.end),
                    limit as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_by_type_and_state: {e}")))?;

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }

    async fn list_attempts(&self, id: JobId) -> Result<Vec<AttemptRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ATTEMPT_COLUMNS} FROM job_attempts WHERE job_id = ?1 ORDER BY id ASC"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_attempts: {e}")))?;

        let mut attempts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_attempt(&row) {
                Ok(a) => attempts.push(a),
                Err(e) => warn!("Skipping attempt row: {e}"),
            }
        }
        Ok(attempts)
    }

    async fn set_progress(
        &self,
        id: JobId,
        progress: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET progress = ?1, updated_at = ?2 WHERE id = ?3 AND state = 'running'",
                params![to_json(progress)?, to_millis(now), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_progress: {e}")))?;
        Ok(changed > 0)
    }

    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let cutoff = to_millis(older_than);
        self.conn()
            .execute(
                "DELETE FROM job_attempts WHERE job_id IN (SELECT id FROM jobs WHERE state IN ('succeeded', 'cancelled') AND finished_at < ?1)",
                params![cutoff],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_finished attempts: {e}")))?;

        let deleted = self
            .conn()
            .execute(
                "DELETE FROM jobs WHERE state IN ('succeeded', 'cancelled') AND finished_at < ?1",
                params![cutoff],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_finished: {e}")))?;

        if deleted > 0 {
            info!(count = deleted, "Purged finished jobs");
        }
        Ok(deleted as usize)
    }
}

// ── Schedule entries ────────────────────────────────────────────────

#[async_trait]
impl ScheduleStore for LibSqlBackend {
    async fn upsert_entry(&self, entry: &ScheduleEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO schedule_entries (name, job_type, payload, priority, cadence, enabled, next_fire_at, last_fired_at, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT(name) DO UPDATE SET job_type = excluded.job_type, payload = excluded.payload, priority = excluded.priority, cadence = excluded.cadence, enabled = excluded.enabled, next_fire_at = excluded.next_fire_at, last_fired_at = excluded.last_fired_at, updated_at = excluded.updated_at",
                params![
                    entry.name.clone(),
                    entry.job_type.clone(),
                    to_json(&entry.payload)?,
                    opt_integer(entry.priority.map(i64::from)),
                    entry.cadence.to_string(),
                    entry.enabled as i64,
                    to_millis(entry.next_fire_at),
                    opt_millis(entry.last_fired_at),
                    to_millis(entry.created_at),
                    to_millis(entry.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_entry: {e}")))?;
        Ok(())
    }

    async fn get_entry(&self, name: &str) -> Result<Option<ScheduleEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ENTRY_COLUMNS} FROM schedule_entries WHERE name = ?1"),
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_entry: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_entry(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_entry: {e}"))),
        }
    }

    async fn list_entries(&self) -> Result<Vec<ScheduleEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ENTRY_COLUMNS} FROM schedule_entries ORDER BY name"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_entries: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_entry(&row) {
                Ok(e) => entries.push(e),
                Err(e) => warn!("Skipping schedule entry row: {e}"),
            }
        }
        Ok(entries)
    }

    async fn list_due_entries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM schedule_entries WHERE enabled = 1 AND next_fire_at <= ?1 ORDER BY next_fire_at, name"
                ),
                params![to_millis(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_due_entries: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_entry(&row) {
                Ok(e) => entries.push(e),
                Err(e) => warn!("Skipping due schedule entry row: {e}"),
            }
        }
        Ok(entries)
    }

    async fn advance_entry(
        &self,
        name: &str,
        expected_next: DateTime<Utc>,
        next: DateTime<Utc>,
        fired_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE schedule_entries SET next_fire_at = ?1, last_fired_at = COALESCE(?2, last_fired_at), updated_at = ?3 WHERE name = ?4 AND next_fire_at = ?5",
                params![
                    to_millis(next),
                    opt_millis(fired_at),
                    to_millis(Utc::now()),
                    name,
                    to_millis(expected_next),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("advance_entry: {e}")))?;
        Ok(changed > 0)
    }

    async fn set_entry_enabled(&self, name: &str, enabled: bool) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE schedule_entries SET enabled = ?1, updated_at = ?2 WHERE name = ?3",
                params![enabled as i64, to_millis(Utc::now()), name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_entry_enabled: {e}")))?;
        Ok(changed > 0)
    }

    async fn delete_entry(&self, name: &str) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "DELETE FROM schedule_entries WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_entry: {e}")))?;
        Ok(changed > 0)
    }
}

// ── Leader lock ─────────────────────────────────────────────────────

#[async_trait]
impl LeaderLock for LibSqlBackend {
    async fn try_acquire_lock(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        let changed = self
            .conn()
            .execute(
                "INSERT INTO leader_locks (name, holder, acquired_at, expires_at) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(name) DO UPDATE SET \
                     acquired_at = CASE WHEN leader_locks.holder = excluded.holder THEN leader_locks.acquired_at ELSE excluded.acquired_at END, \
                     holder = excluded.holder, \
                     expires_at = excluded.expires_at \
                 WHERE leader_locks.holder = excluded.holder OR leader_locks.expires_at <= ?3",
                params![name, holder, to_millis(now), to_millis(expires_at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_acquire_lock: {e}")))?;
        Ok(changed > 0)
    }

    async fn release_lock(&self, name: &str, holder: &str) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "DELETE FROM leader_locks WHERE name = ?1 AND holder = ?2",
                params![name, holder],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_lock: {e}")))?;
        Ok(changed > 0)
    }

    async fn lock_holder(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT holder FROM leader_locks WHERE name = ?1 AND expires_at > ?2",
                params![name, to_millis(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("lock_holder: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get(0).map_err(col_err)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("lock_holder: {e}"))),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
