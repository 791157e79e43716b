//! Beat scheduler: cadences, persisted entries and the leader-elected tick loop.

pub mod cadence;
pub mod entry;
pub mod scheduler;

pub use cadence::Cadence;
pub use entry::{ScheduleDefinition, ScheduleEntry};
pub use scheduler::{Beat, TickReport, configured_definitions, spawn_beat};
