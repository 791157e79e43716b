//! Schedule cadences: fixed intervals and cron expressions.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ScheduleError;

/// How often a schedule entry fires.
///
/// Written as `every <n><unit>` (unit is `s`, `m`, `h` or `d`) or as a cron
/// expression. Five-field cron expressions get a leading seconds field of `0`;
/// six and seven field expressions and `@daily`-style shorthands are used as
/// given. All times are UTC.
#[derive(Debug, Clone)]
pub enum Cadence {
    Interval { every: Duration },
    Cron { expr: String, schedule: Box<cron::Schedule> },
}

impl Cadence {
    pub fn every(every: Duration) -> Result<Self, ScheduleError> {
        if every.as_secs() == 0 || every.subsec_nanos() != 0 {
            return Err(ScheduleError::InvalidCadence {
                cadence: format!("{every:?}"),
                reason: "interval must be a positive whole number of seconds".into(),
            });
        }
        Ok(Self::Interval { every })
    }

    pub fn cron(expr: &str) -> Result<Self, ScheduleError> {
        let expr = expr.trim();
        let normalized = if expr.starts_with('@') {
            expr.to_string()
        } else {
            match expr.split_whitespace().count() {
                5 => format!("0 {expr}"),
                6 | 7 => expr.to_string(),
                n => {
                    return Err(ScheduleError::InvalidCadence {
                        cadence: expr.to_string(),
                        reason: format!("expected 5, 6 or 7 cron fields, got {n}"),
                    });
                }
            }
        };

        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCadence {
                cadence: expr.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self::Cron {
            expr: expr.to_string(),
            schedule: Box::new(schedule),
        })
    }

    /// First fire time for an entry created at `now`.
    pub fn first_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval { every } => Some(now + to_chrono(*every)),
            Self::Cron { schedule, .. } => schedule.after(&now).next(),
        }
    }

    /// Next fire time after an entry that was due at `due` fires at `now`.
    ///
    /// The result is always strictly after `now`, so any number of missed fires
    /// collapse into the one that just happened. Intervals stay aligned to
    /// `due`.
    pub fn next_after(&self, due: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval { every } => {
                let every_ms = (every.as_millis() as i64).max(1);
                if due > now {
                    return Some(due);
                }
                let elapsed = (now - due).num_milliseconds();
                let steps = elapsed / every_ms + 1;
                Some(due + chrono::Duration::milliseconds(steps.saturating_mul(every_ms)))
            }
            Self::Cron { schedule, .. } => schedule.after(&now).next(),
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn parse_interval(raw: &str, spec: &str) -> Result<Duration, ScheduleError> {
    let invalid = |reason: &str| ScheduleError::InvalidCadence {
        cadence: raw.to_string(),
        reason: reason.to_string(),
    };

    let spec = spec.trim();
    let split = spec
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| invalid("missing unit (s, m, h or d)"))?;
    let (digits, unit) = spec.split_at(split);
    let n: u64 = digits.parse().map_err(|_| invalid("missing interval count"))?;

    let secs = match unit.trim() {
        "s" | "sec" | "secs" | "seconds" => n,
        "m" | "min" | "mins" | "minutes" => n.saturating_mul(60),
        "h" | "hour" | "hours" => n.saturating_mul(3600),
        "d" | "day" | "days" => n.saturating_mul(86_400),
        other => return Err(invalid(&format!("unknown unit '{other}'"))),
    };

    if secs == 0 {
        return Err(invalid("interval must be greater than zero"));
    }
    Ok(Duration::from_secs(secs))
}

impl FromStr for Cadence {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.strip_prefix("every ") {
            Some(rest) => Self::every(parse_interval(trimmed, rest)?),
            None => Self::cron(trimmed),
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval { every } => {
                let secs = every.as_secs();
                if secs % 86_400 == 0 {
                    write!(f, "every {}d", secs / 86_400)
                } else if secs % 3600 == 0 {
                    write!(f, "every {}h", secs / 3600)
                } else if secs % 60 == 0 {
                    write!(f, "every {}m", secs / 60)
                } else {
                    write!(f, "every {secs}s")
                }
            }
            Self::Cron { expr, .. } => f.write_str(expr),
        }
    }
}

impl PartialEq for Cadence {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Interval { every: a }, Self::Interval { every: b }) => a == b,
            (Self::Cron { expr: a, .. }, Self::Cron { expr: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Serialize for Cadence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cadence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn parse_intervals() {
        assert_eq!(
            "every 60s".parse::<Cadence>().unwrap(),
            Cadence::every(Duration::from_secs(60)).unwrap()
        );
        assert_eq!(
            "every 5m".parse::<Cadence>().unwrap(),
            Cadence::every(Duration::from_secs(300)).unwrap()
        );
        assert_eq!(
            "every 1d".parse::<Cadence>().unwrap().to_string(),
            "every 1d"
        );
        assert_eq!("every 90s".parse::<Cadence>().unwrap().to_string(), "every 90s");
        assert!("every 0s".parse::<Cadence>().is_err());
        assert!("every s".parse::<Cadence>().is_err());
        assert!("every 5y".parse::<Cadence>().is_err());
    }

    #[test]
    fn parse_cron_variants() {
        assert!("0 2 * * *".parse::<Cadence>().is_ok());
        assert!("0 0 2 * * *".parse::<Cadence>().is_ok());
        assert!("@hourly".parse::<Cadence>().is_ok());
        assert!("not a cron".parse::<Cadence>().is_err());
        assert!("* *".parse::<Cadence>().is_err());
    }

    #[test]
    fn five_field_cron_fires_at_minute_boundary() {
        // Nightly archive at 02:00 UTC
        let cadence: Cadence = "0 2 * * *".parse().unwrap();
        let next = cadence.first_after(t(1, 30, 0)).unwrap();
        assert_eq!(next, t(2, 0, 0));

        let after = cadence.next_after(t(2, 0, 0), t(2, 0, 5)).unwrap();
        assert_eq!(after.hour(), 2);
        assert_eq!(after - t(2, 0, 0), chrono::Duration::days(1));
    }

    #[test]
    fn interval_collapses_missed_fires() {
        let cadence = Cadence::every(Duration::from_secs(60)).unwrap();
        let due = t(0, 2, 0);

        // Fired on time: next slot
        assert_eq!(cadence.next_after(due, due), Some(t(0, 3, 0)));
        // 56s late: still the next slot
        assert_eq!(cadence.next_after(due, t(0, 2, 56)), Some(t(0, 3, 0)));
        // Ten minutes of downtime: one fire, then the next aligned slot
        assert_eq!(cadence.next_after(due, t(0, 12, 30)), Some(t(0, 13, 0)));
        // Exactly on a later boundary: strictly after now
        assert_eq!(cadence.next_after(due, t(0, 5, 0)), Some(t(0, 6, 0)));
    }

    #[test]
    fn cron_skips_to_first_occurrence_after_now() {
        let cadence: Cadence = "*/15 * * * *".parse().unwrap();
        let next = cadence.next_after(t(0, 0, 0), t(0, 50, 10)).unwrap();
        assert_eq!(next, t(1, 0, 0));
    }

    #[test]
    fn serde_as_string() {
        let cadence: Cadence = "every 2h".parse().unwrap();
        let json = serde_json::to_string(&cadence).unwrap();
        assert_eq!(json, "\"every 2h\"");
        let back: Cadence = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cadence);
    }
}
