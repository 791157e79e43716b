//! Error types for beatq.

use crate::job::JobId;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors returned by broker calls.
///
/// Why an attempt failed is not an error here; the worker records it on the
/// job as a `FailureKind`.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(#[from] DatabaseError),

    #[error("Job {id} is not leased by worker {worker}")]
    LeaseConflict { id: JobId, worker: String },

    #[error("Job {id} not found")]
    NotFound { id: JobId },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: JobId,
        state: String,
        target: String,
    },
}

/// Scheduler (beat) errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid cadence '{cadence}': {reason}")]
    InvalidCadence { cadence: String, reason: String },

    #[error("Schedule entry {name} not found")]
    NotFound { name: String },

    #[error("Failed to enqueue scheduled job: {0}")]
    Enqueue(#[from] JobError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for beatq.
pub type Result<T> = std::result::Result<T, Error>;
