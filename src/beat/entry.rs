//! Schedule entries: what beat enqueues and when.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::beat::cadence::Cadence;
use crate::error::ScheduleError;

/// A recurring job as declared by the application or configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    /// Unique entry name.
    pub name: String,
    pub job_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Overrides the job type's default priority.
    #[serde(default)]
    pub priority: Option<i32>,
    pub cadence: Cadence,
    /// Fire on the first tick instead of waiting for the first cadence time.
    #[serde(default)]
    pub run_immediately: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleDefinition {
    pub fn new(name: impl Into<String>, job_type: impl Into<String>, cadence: Cadence) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            payload: serde_json::Value::Object(Default::default()),
            priority: None,
            cadence,
            run_immediately: false,
            enabled: true,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn run_immediately(mut self) -> Self {
        self.run_immediately = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Parses `name=job_type@cadence`, as used in `BEATQ_SCHEDULES`.
impl FromStr for ScheduleDefinition {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ScheduleError::InvalidCadence {
            cadence: s.to_string(),
            reason: reason.to_string(),
        };

        let (name, rest) = s
            .split_once('=')
            .ok_or_else(|| invalid("expected name=job_type@cadence"))?;
        let (job_type, cadence) = rest
            .split_once('@')
            .ok_or_else(|| invalid("expected name=job_type@cadence"))?;

        let name = name.trim();
        let job_type = job_type.trim();
        if name.is_empty() || job_type.is_empty() {
            return Err(invalid("name and job type must not be empty"));
        }

        Ok(Self::new(name, job_type, cadence.parse()?))
    }
}

/// A persisted schedule entry with its runtime state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleEntry {
    pub name: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: Option<i32>,
    pub cadence: Cadence,
    pub enabled: bool,
    pub next_fire_at: DateTime<Utc>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleEntry {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_fire_at <= now
    }

    /// Build an entry from its definition, keeping runtime state from
    /// `existing` when the cadence has not changed.
    pub fn from_definition(
        def: &ScheduleDefinition,
        existing: Option<&ScheduleEntry>,
        now: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        let fresh_next = || -> Result<DateTime<Utc>, ScheduleError> {
            if def.run_immediately {
                return Ok(now);
            }
            def.cadence
                .first_after(now)
                .ok_or_else(|| ScheduleError::InvalidCadence {
                    cadence: def.cadence.to_string(),
                    reason: "cadence has no future occurrence".into(),
                })
        };

        let (next_fire_at, last_fired_at, created_at) = match existing {
            Some(prev) if prev.cadence == def.cadence => {
                (prev.next_fire_at, prev.last_fired_at, prev.created_at)
            }
            Some(prev) => (fresh_next()?, prev.last_fired_at, prev.created_at),
            None => (fresh_next()?, None, now),
        };

        Ok(Self {
            name: def.name.clone(),
            job_type: def.job_type.clone(),
            payload: def.payload.clone(),
            priority: def.priority,
            cadence: def.cadence.clone(),
            enabled: def.enabled,
            next_fire_at,
            last_fired_at,
            created_at,
            updated_at: now,
        })
    }
}
