//! Configuration types.
//!
//! Everything is read from `BEATQ_*` environment variables with defaults, so a
//! bare `beatq all` runs against `./data/beatq.db`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::beat::entry::ScheduleDefinition;
use crate::error::ConfigError;
use crate::job::backoff::BackoffPolicy;
use crate::job::registry::JobPolicy;

/// Where the broker and result store live.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Local database file, used when no remote URL is set.
    pub path: PathBuf,
    pub remote_url: Option<String>,
    pub auth_token: Option<SecretString>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/beatq.db"),
            remote_url: None,
            auth_token: None,
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent workers in the pool.
    pub concurrency: usize,
    /// Jobs leased per dequeue. Executed one after another.
    pub batch_size: usize,
    /// Sleep when the queue is empty.
    pub poll_interval: Duration,
    /// First pause after a broker error; doubles up to `broker_retry_max_delay`.
    pub broker_retry_delay: Duration,
    pub broker_retry_max_delay: Duration,
    /// Worker ids are `<id_prefix>-<n>`.
    pub id_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            batch_size: 1,
            poll_interval: Duration::from_millis(500),
            broker_retry_delay: Duration::from_secs(1),
            broker_retry_max_delay: Duration::from_secs(30),
            id_prefix: default_id_prefix(),
        }
    }
}

fn default_id_prefix() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "beatq".to_string());
    format!("{host}-{}", std::process::id())
}

/// Beat scheduler configuration.
#[derive(Debug, Clone)]
pub struct BeatConfig {
    pub tick_interval: Duration,
    /// Leader lock lifetime. A dead leader is replaced after this long.
    pub lock_ttl: Duration,
    pub lock_name: String,
    /// Entries registered at startup.
    pub schedules: Vec<ScheduleDefinition>,
    /// Finished jobs older than this are purged. `None` disables the sweep.
    pub retention: Option<Duration>,
    /// How often the purge sweep runs when retention is set.
    pub purge_interval: Duration,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            lock_ttl: Duration::from_secs(30),
            lock_name: "beat".to_string(),
            schedules: Vec::new(),
            retention: None,
            purge_interval: Duration::from_secs(3600),
        }
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub beat: BeatConfig,
    pub job_defaults: JobPolicy,
    pub backoff: BackoffPolicy,
    /// Directory for daily-rolling log files. Stdout only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup. Unset keys keep their defaults.
    pub fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut s = Settings::default();

        // ── Database ────────────────────────────────────────────────
        if let Some(path) = var("BEATQ_DATABASE_PATH") {
            s.database.path = PathBuf::from(path);
        }
        s.database.remote_url = var("BEATQ_DATABASE_URL").filter(|v| !v.is_empty());
        s.database.auth_token = var("BEATQ_DATABASE_AUTH_TOKEN")
            .filter(|v| !v.is_empty())
            .map(SecretString::from);

        // ── Workers ─────────────────────────────────────────────────
        if let Some(n) = parse::<usize>(&var, "BEATQ_WORKER_CONCURRENCY")? {
            s.worker.concurrency = positive("BEATQ_WORKER_CONCURRENCY", n)?;
        }
        if let Some(n) = parse::<usize>(&var, "BEATQ_WORKER_BATCH_SIZE")? {
            s.worker.batch_size = positive("BEATQ_WORKER_BATCH_SIZE", n)?;
        }
        if let Some(ms) = parse::<u64>(&var, "BEATQ_POLL_INTERVAL_MS")? {
            s.worker.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&var, "BEATQ_BROKER_RETRY_MS")? {
            s.worker.broker_retry_delay = Duration::from_millis(ms);
            s.worker.broker_retry_max_delay =
                s.worker.broker_retry_max_delay.max(s.worker.broker_retry_delay);
        }

        // ── Job defaults ────────────────────────────────────────────
        if let Some(secs) = parse::<u64>(&var, "BEATQ_VISIBILITY_TIMEOUT_SECS")? {
            s.job_defaults.visibility_timeout =
                Duration::from_secs(positive("BEATQ_VISIBILITY_TIMEOUT_SECS", secs)?);
        }
        if let Some(secs) = parse::<u64>(&var, "BEATQ_JOB_TIMEOUT_SECS")? {
            s.job_defaults.timeout = Duration::from_secs(positive("BEATQ_JOB_TIMEOUT_SECS", secs)?);
        }
        if let Some(n) = parse::<u32>(&var, "BEATQ_MAX_ATTEMPTS")? {
            s.job_defaults.max_attempts = positive("BEATQ_MAX_ATTEMPTS", n)?;
        }

        // ── Backoff ─────────────────────────────────────────────────
        if let Some(ms) = parse::<u64>(&var, "BEATQ_BACKOFF_BASE_MS")? {
            s.backoff.base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&var, "BEATQ_BACKOFF_MAX_MS")? {
            s.backoff.max = Duration::from_millis(ms);
        }
        if s.backoff.max < s.backoff.base {
            return Err(ConfigError::InvalidValue {
                key: "BEATQ_BACKOFF_MAX_MS".into(),
                message: "must not be smaller than BEATQ_BACKOFF_BASE_MS".into(),
            });
        }
        if let Some(jitter) = parse::<f64>(&var, "BEATQ_BACKOFF_JITTER")? {
            if !(0.0..=1.0).contains(&jitter) {
                return Err(ConfigError::InvalidValue {
                    key: "BEATQ_BACKOFF_JITTER".into(),
                    message: format!("{jitter} is outside 0..=1"),
                });
            }
            s.backoff = s.backoff.with_jitter(jitter);
        }

        // ── Beat ────────────────────────────────────────────────────
        if let Some(secs) = parse::<u64>(&var, "BEATQ_BEAT_TICK_SECS")? {
            s.beat.tick_interval = Duration::from_secs(positive("BEATQ_BEAT_TICK_SECS", secs)?);
        }
        if let Some(secs) = parse::<u64>(&var, "BEATQ_BEAT_LOCK_TTL_SECS")? {
            s.beat.lock_ttl = Duration::from_secs(positive("BEATQ_BEAT_LOCK_TTL_SECS", secs)?);
        }
        if s.beat.lock_ttl <= s.beat.tick_interval {
            return Err(ConfigError::InvalidValue {
                key: "BEATQ_BEAT_LOCK_TTL_SECS".into(),
                message: "lock TTL must be longer than the tick interval".into(),
            });
        }
        if let Some(raw) = var("BEATQ_SCHEDULES") {
            s.beat.schedules = parse_schedules(&raw)?;
        }
        if let Some(secs) = parse::<u64>(&var, "BEATQ_RETENTION_SECS")? {
            s.beat.retention = (secs > 0).then(|| Duration::from_secs(secs));
        }

        s.log_dir = var("BEATQ_LOG_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Ok(s)
    }
}

/// Parse `name=job_type@cadence;name=job_type@cadence`.
pub fn parse_schedules(raw: &str) -> Result<Vec<ScheduleDefinition>, ConfigError> {
    raw.split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<ScheduleDefinition>()
                .map_err(|e| ConfigError::InvalidValue {
                    key: "BEATQ_SCHEDULES".into(),
                    message: e.to_string(),
                })
        })
        .collect()
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}

fn positive<T: PartialOrd + Default>(key: &str, value: T) -> Result<T, ConfigError> {
    if value <= T::default() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".into(),
        });
    }
    Ok(value)
}
