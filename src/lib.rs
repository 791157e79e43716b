//! beatq: durable background jobs on libSQL.
//!
//! Producers submit jobs through [`JobQueue`], a [`WorkerPool`] leases and
//! executes them with retry and backoff, and [`Beat`] enqueues recurring jobs
//! from a leader-elected schedule.

pub mod beat;
pub mod config;
pub mod error;
pub mod job;
pub mod store;
pub mod worker;

pub use beat::{Beat, Cadence, ScheduleDefinition};
pub use config::Settings;
pub use error::{Error, Result};
pub use job::{JobId, JobQueue, JobRegistry, JobState, JobStatus, SubmitOptions};
pub use store::{Database, LibSqlBackend};
pub use worker::{WorkerPool, WorkerPoolHandle};
