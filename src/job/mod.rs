//! Jobs: the data model, handlers, registry and producer API.

pub mod backoff;
pub mod builtin;
pub mod context;
pub mod handler;
pub mod model;
pub mod queue;
pub mod registry;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use context::JobContext;
pub use handler::{JobHandler, TypedJob, handler_fn, typed};
pub use model::{
    AttemptRecord, FailOutcome, FailureKind, Job, JobFailure, JobId, JobState, JobStatus, NewJob,
    QueueStats, TimeRange,
};
pub use queue::{JobQueue, SubmitOptions};
pub use registry::{JobPolicy, JobRegistry, RegisteredJob};
