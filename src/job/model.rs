//! Core job types and the job state machine.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::registry::JobPolicy;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// State of a job.
///
/// A job row moves `pending → running → succeeded | retrying | dead`, and
/// `retrying → running` again. `Failed` only appears on attempt records: it
/// marks an attempt that failed while a retry was still allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Dead,
    Cancelled,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Cancelled) |
            (Running, Succeeded) | (Running, Retrying) | (Running, Dead) |
            (Retrying, Running) | (Retrying, Cancelled) |
            // Operator requeue of an exhausted job
            (Dead, Pending)
        )
    }

    /// Terminal states are never left by the worker or the broker on their own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Dead | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Dead => "dead",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            "dead" => Ok(Self::Dead),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No handler registered for the job type. Fatal.
    UnknownJobType,
    /// The handler exceeded its timeout.
    HandlerTimeout,
    /// The handler returned an error or panicked.
    HandlerException,
    /// The worker holding the lease went silent until the lease expired.
    LeaseExpired,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::UnknownJobType)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownJobType => "unknown_job_type",
            Self::HandlerTimeout => "handler_timeout",
            Self::HandlerException => "handler_exception",
            Self::LeaseExpired => "lease_expired",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown_job_type" => Ok(Self::UnknownJobType),
            "handler_timeout" => Ok(Self::HandlerTimeout),
            "handler_exception" => Ok(Self::HandlerException),
            "lease_expired" => Ok(Self::LeaseExpired),
            other => Err(format!("unknown failure kind: {other}")),
        }
    }
}

/// A recorded attempt failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unknown_job_type(job_type: &str) -> Self {
        Self::new(
            FailureKind::UnknownJobType,
            format!("no handler registered for job type '{job_type}'"),
        )
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self::new(
            FailureKind::HandlerTimeout,
            format!("handler exceeded timeout of {timeout:?}"),
        )
    }

    pub fn exception(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::HandlerException, reason)
    }

    pub fn lease_expired(worker_id: &str) -> Self {
        Self::new(
            FailureKind::LeaseExpired,
            format!("lease held by {worker_id} expired before completion"),
        )
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Time-bounded exclusive claim on a job by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A job to be stored by the broker.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub visibility_timeout: Duration,
    pub enqueued_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
}

impl NewJob {
    /// Create a job that is eligible immediately, using the given policy.
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value, policy: &JobPolicy) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            priority: policy.default_priority,
            max_attempts: policy.max_attempts.max(1),
            timeout: policy.timeout,
            visibility_timeout: policy.visibility_timeout,
            enqueued_at: now,
            run_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay eligibility until `run_at`.
    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = run_at;
        self
    }

    /// Delay eligibility by `delay` from the enqueue time.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.run_at =
            self.enqueued_at + chrono::Duration::from_std(delay).unwrap_or_default();
        self
    }
}

/// A stored job and its current status.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    /// Enqueue order within the broker; breaks FIFO ties within a priority.
    pub seq: i64,
    pub id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub state: JobState,
    /// Finished executions so far, including expired leases and the final success.
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub visibility_timeout: Duration,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the job may be dequeued.
    pub run_at: DateTime<Utc>,
    pub lease: Option<Lease>,
    pub started_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub error: Option<JobFailure>,
    pub progress: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The 1-based number of the attempt currently (or last) running.
    pub fn current_attempt(&self) -> u32 {
        self.attempt_count + 1
    }
}

/// Producer-facing view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub job_type: String,
    pub state: JobState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub output: Option<serde_json::Value>,
    pub error: Option<JobFailure>,
    pub progress: Option<serde_json::Value>,
    pub enqueued_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobStatus {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type,
            state: job.state,
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts,
            output: job.output,
            error: job.error,
            progress: job.progress,
            enqueued_at: job.enqueued_at,
            run_at: job.run_at,
            started_at: job.started_at,
            updated_at: job.updated_at,
            finished_at: job.finished_at,
        }
    }
}

/// What `fail` decided for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Another attempt is scheduled at `run_at`.
    Retrying { attempt: u32, run_at: DateTime<Utc> },
    /// Retries exhausted (or the failure was fatal).
    Dead { attempts: u32 },
}

/// One finished attempt of a job.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub job_id: JobId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub worker_id: Option<String>,
    /// `Succeeded`, `Failed` (retry scheduled) or `Dead`.
    pub state: JobState,
    pub output: Option<serde_json::Value>,
    pub error: Option<JobFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

/// Per-state job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub succeeded: u64,
    pub retrying: u64,
    pub dead: u64,
    pub cancelled: u64,
}

/// Half-open time window `[start, end)` for status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The window ending now and reaching back `span`.
    pub fn last(span: Duration) -> Self {
        let end = Utc::now();
        let start = end - chrono::Duration::from_std(span).unwrap_or_default();
        Self { start, end }
    }

    /// Everything, for when no window is wanted.
    pub fn all() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_allows_retry_cycle() {
        assert!(JobState::Pending.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Retrying));
        assert!(JobState::Retrying.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Dead));
        assert!(JobState::Running.can_transition_to(JobState::Succeeded));
    }

    #[test]
    fn state_machine_is_monotonic() {
        assert!(!JobState::Succeeded.can_transition_to(JobState::Running));
        assert!(!JobState::Succeeded.can_transition_to(JobState::Pending));
        assert!(!JobState::Dead.can_transition_to(JobState::Running));
        assert!(!JobState::Running.can_transition_to(JobState::Pending));
        assert!(!JobState::Running.can_transition_to(JobState::Cancelled));
        assert!(!JobState::Cancelled.can_transition_to(JobState::Pending));
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Dead.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Retrying.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn state_display_parse() {
        for state in [
            JobState::Pending,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed,
            JobState::Retrying,
            JobState::Dead,
            JobState::Cancelled,
        ] {
            let parsed: JobState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("exploded".parse::<JobState>().is_err());
    }

    #[test]
    fn unknown_job_type_is_fatal() {
        let failure = JobFailure::unknown_job_type("send_email");
        assert_eq!(failure.kind, FailureKind::UnknownJobType);
        assert!(!failure.kind.is_retryable());
        assert!(failure.message.contains("send_email"));
        assert!(FailureKind::HandlerTimeout.is_retryable());
        assert!(FailureKind::LeaseExpired.is_retryable());
    }

    #[test]
    fn delayed_job_runs_later() {
        let job = NewJob::new("report", serde_json::json!({}), &JobPolicy::default())
            .delayed(Duration::from_secs(30));
        assert_eq!((job.run_at - job.enqueued_at).num_seconds(), 30);
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        let job = NewJob::new("report", serde_json::json!({}), &JobPolicy::default())
            .with_max_attempts(0);
        assert_eq!(job.max_attempts, 1);
    }

    #[test]
    fn job_id_roundtrip() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
