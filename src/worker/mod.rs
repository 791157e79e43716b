//! Worker system: job execution against the broker.
//!
//! Core components:
//! - `worker`: one agent: dequeue, execute under timeout and heartbeat, ack/fail
//! - `pool`: N workers with shared counters and graceful shutdown

pub mod pool;
pub mod worker;

pub use pool::{WorkerPool, WorkerPoolHandle};
pub use worker::{Outcome, Worker, WorkerDeps, WorkerStats, WorkerStatsSnapshot};
