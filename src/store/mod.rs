//! Persistence layer: libSQL-backed broker, result store and beat tables.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Broker, Database, LeaderLock, ResultStore, ScheduleStore};
