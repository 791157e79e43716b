//! Beat: the leader-elected clock that enqueues recurring jobs.
//!
//! Beat never executes jobs. Every tick the instance holding the leader lock
//! moves each due entry to its next cadence time after `now` and submits one
//! job for it, so downtime produces a single catch-up fire rather than a
//! burst. Non-leaders just keep trying to take the lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::beat::cadence::Cadence;
use crate::beat::entry::{ScheduleDefinition, ScheduleEntry};
use crate::config::BeatConfig;
use crate::error::{JobError, ScheduleError};
use crate::job::builtin::PURGE_FINISHED;
use crate::job::model::JobId;
use crate::job::queue::{JobQueue, SubmitOptions};
use crate::store::Database;
use crate::store::traits::{LeaderLock, ScheduleStore};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Whether this instance held the leader lock for the tick.
    pub leader: bool,
    /// Entries fired, with the job each one enqueued.
    pub fired: Vec<(String, JobId)>,
    /// Entries whose enqueue failed; they stay due for the next tick.
    pub failed: Vec<String>,
}

/// The scheduler.
pub struct Beat {
    queue: JobQueue,
    config: BeatConfig,
    instance_id: String,
    is_leader: AtomicBool,
}

impl Beat {
    pub fn new(queue: JobQueue, config: BeatConfig) -> Self {
        let instance_id = format!("beat-{}", Uuid::new_v4());
        Self::with_instance_id(queue, config, instance_id)
    }

    pub fn with_instance_id(
        queue: JobQueue,
        config: BeatConfig,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            config,
            instance_id: instance_id.into(),
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &BeatConfig {
        &self.config
    }

    fn db(&self) -> &Arc<dyn Database> {
        self.queue.db()
    }

    /// Create or update an entry by name. Runtime state survives restarts as
    /// long as the cadence is unchanged.
    pub async fn register_entry(
        &self,
        def: &ScheduleDefinition,
    ) -> Result<ScheduleEntry, ScheduleError> {
        self.register_entry_at(def, Utc::now()).await
    }

    pub async fn register_entry_at(
        &self,
        def: &ScheduleDefinition,
        now: DateTime<Utc>,
    ) -> Result<ScheduleEntry, ScheduleError> {
        let existing = self.db().get_entry(&def.name).await?;
        let entry = ScheduleEntry::from_definition(def, existing.as_ref(), now)?;
        self.db().upsert_entry(&entry).await?;

        if !self.queue.registry().has(&def.job_type).await {
            tracing::warn!(
                entry = %def.name,
                job_type = %def.job_type,
                "Schedule entry targets a job type with no handler in this process"
            );
        }
        tracing::info!(
            entry = %entry.name,
            cadence = %entry.cadence,
            next_fire_at = %entry.next_fire_at,
            "Schedule entry registered"
        );
        Ok(entry)
    }

    /// Register every entry from configuration, plus the retention sweep when
    /// a retention period is set.
    pub async fn register_configured(&self) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        let mut entries = Vec::new();
        for def in configured_definitions(&self.config)? {
            entries.push(self.register_entry(&def).await?);
        }
        Ok(entries)
    }

    pub async fn remove_entry(&self, name: &str) -> Result<bool, ScheduleError> {
        Ok(self.db().delete_entry(name).await?)
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), ScheduleError> {
        if !self.db().set_entry_enabled(name, enabled).await? {
            return Err(ScheduleError::NotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub async fn entries(&self) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        Ok(self.db().list_entries().await?)
    }

    /// Take or renew the leader lock, then fire every due entry once.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, ScheduleError> {
        let leader = self
            .db()
            .try_acquire_lock(
                &self.config.lock_name,
                &self.instance_id,
                self.config.lock_ttl,
                now,
            )
            .await?;

        let was_leader = self.is_leader.swap(leader, Ordering::Relaxed);
        match (was_leader, leader) {
            (false, true) => tracing::info!(instance = %self.instance_id, "Acquired beat leadership"),
            (true, false) => tracing::warn!(instance = %self.instance_id, "Lost beat leadership"),
            _ => {}
        }

        let mut report = TickReport {
            leader,
            ..Default::default()
        };
        if !leader {
            return Ok(report);
        }

        for entry in self.db().list_due_entries(now).await? {
            match self.fire(&entry, now).await {
                Ok(Some(job_id)) => report.fired.push((entry.name.clone(), job_id)),
                Ok(None) => {
                    tracing::debug!(entry = %entry.name, "Entry changed since it was listed, skipped");
                }
                Err(e) => {
                    tracing::warn!(entry = %entry.name, error = %e, "Scheduled enqueue failed, will retry next tick");
                    report.failed.push(entry.name.clone());
                }
            }
        }

        Ok(report)
    }

    /// Claim the entry's due slot, then enqueue its job.
    ///
    /// The slot is claimed by moving `next_fire_at` past `now` before the
    /// enqueue, so a store error afterwards cannot fire the slot twice. A
    /// failed enqueue puts the entry back. Returns `None` when another writer
    /// moved the entry first.
    async fn fire(
        &self,
        entry: &ScheduleEntry,
        now: DateTime<Utc>,
    ) -> Result<Option<JobId>, ScheduleError> {
        if !entry.is_due(now) {
            return Ok(None);
        }
        let due = entry.next_fire_at;
        let next = entry.cadence.next_after(due, now);
        let claimed = match next {
            Some(next) => self.db().advance_entry(&entry.name, due, next, None).await?,
            None => self.db().set_entry_enabled(&entry.name, false).await?,
        };
        if !claimed {
            return Ok(None);
        }

        let job_id = match self.submit_entry(entry).await {
            Ok(job_id) => job_id,
            Err(e) => {
                self.restore_slot(entry, next).await;
                return Err(e.into());
            }
        };

        let fired_at = next.unwrap_or(due);
        if let Err(e) = self
            .db()
            .advance_entry(&entry.name, fired_at, fired_at, Some(now))
            .await
        {
            tracing::warn!(entry = %entry.name, error = %e, "Could not record fire time");
        }

        match next {
            Some(next) => tracing::info!(
                entry = %entry.name,
                job_id = %job_id,
                next_fire_at = %next,
                "Scheduled job enqueued"
            ),
            None => tracing::warn!(
                entry = %entry.name,
                job_id = %job_id,
                "Cadence has no further occurrences, entry disabled"
            ),
        }
        Ok(Some(job_id))
    }

    async fn restore_slot(&self, entry: &ScheduleEntry, next: Option<DateTime<Utc>>) {
        let restored = match next {
            Some(next) => {
                self.db()
                    .advance_entry(&entry.name, next, entry.next_fire_at, None)
                    .await
            }
            None => self.db().set_entry_enabled(&entry.name, true).await,
        };
        if let Err(e) = restored {
            tracing::error!(
                entry = %entry.name,
                error = %e,
                "Could not restore entry after failed enqueue, slot skipped"
            );
        }
    }

    async fn submit_entry(&self, entry: &ScheduleEntry) -> Result<JobId, JobError> {
        self.queue
            .submit(
                &entry.job_type,
                entry.payload.clone(),
                SubmitOptions {
                    priority: entry.priority,
                    ..Default::default()
                },
            )
            .await
    }

    /// Fire an entry right away, outside its cadence. Its schedule is not
    /// moved.
    pub async fn trigger_now(&self, name: &str) -> Result<JobId, ScheduleError> {
        let entry = self
            .db()
            .get_entry(name)
            .await?
            .ok_or_else(|| ScheduleError::NotFound {
                name: name.to_string(),
            })?;

        let job_id = self.submit_entry(&entry).await?;

        self.db()
            .advance_entry(&entry.name, entry.next_fire_at, entry.next_fire_at, Some(Utc::now()))
            .await?;
        tracing::info!(entry = %name, job_id = %job_id, "Schedule entry triggered manually");
        Ok(job_id)
    }

    /// Give up leadership so another instance can take over without waiting
    /// for the lock TTL.
    pub async fn shutdown(&self) -> Result<(), ScheduleError> {
        if self.is_leader.swap(false, Ordering::Relaxed) {
            self.db()
                .release_lock(&self.config.lock_name, &self.instance_id)
                .await?;
            tracing::info!(instance = %self.instance_id, "Released beat leadership");
        }
        Ok(())
    }
}

/// Entries declared by configuration.
pub fn configured_definitions(config: &BeatConfig) -> Result<Vec<ScheduleDefinition>, ScheduleError> {
    let mut defs = config.schedules.clone();
    if config.retention.is_some() && !defs.iter().any(|d| d.job_type == PURGE_FINISHED) {
        defs.push(ScheduleDefinition::new(
            PURGE_FINISHED,
            PURGE_FINISHED,
            Cadence::every(config.purge_interval)?,
        ));
    }
    Ok(defs)
}

/// Spawn the beat loop. Ticks every `tick_interval` until `shutdown` flips,
/// then releases the lock.
pub fn spawn_beat(
    beat: Arc<Beat>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(beat.config.tick_interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            instance = %beat.instance_id,
            tick = ?beat.config.tick_interval,
            "Beat started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match beat.tick(Utc::now()).await {
                        Ok(report) if !report.fired.is_empty() => {
                            tracing::debug!(fired = report.fired.len(), failed = report.failed.len(), "Beat tick");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "Beat tick failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = beat.shutdown().await {
            tracing::warn!(error = %e, "Failed to release beat lock");
        }
        tracing::info!(instance = %beat.instance_id, "Beat stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::registry::JobRegistry;
    use crate::store::LibSqlBackend;
    use crate::error::DatabaseError;
    use crate::job::model::{
        AttemptRecord, FailOutcome, Job, JobFailure, JobState, NewJob, QueueStats, TimeRange,
    };
    use crate::store::traits::{Broker, ResultStore};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn config() -> BeatConfig {
        BeatConfig {
            lock_ttl: Duration::from_secs(30),
            ..BeatConfig::default()
        }
    }

    async fn beat_with_db(id: &str, db: Arc<dyn Database>) -> Beat {
        let queue = JobQueue::new(db, Arc::new(JobRegistry::new()));
        Beat::with_instance_id(queue, config(), id)
    }

    async fn beat(id: &str) -> Beat {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        beat_with_db(id, db).await
    }

    fn every_minute() -> ScheduleDefinition {
        ScheduleDefinition::new("heartbeat", "ping", "every 60s".parse().unwrap())
            .with_payload(json!({"source": "beat"}))
            .run_immediately()
    }

    #[tokio::test]
    async fn fires_due_entry_once_and_advances() {
        let beat = beat("a").await;
        beat.register_entry_at(&every_minute(), t0()).await.unwrap();

        let report = beat.tick(t0()).await.unwrap();
        assert!(report.leader);
        assert_eq!(report.fired.len(), 1);

        let entry = beat.db().get_entry("heartbeat").await.unwrap().unwrap();
        assert_eq!(entry.next_fire_at, t0() + secs(60));
        assert_eq!(entry.last_fired_at, Some(t0()));

        // Same instant again: nothing due
        assert!(beat.tick(t0()).await.unwrap().fired.is_empty());

        let (_, job_id) = &report.fired[0];
        let job = beat.db().get_job(*job_id).await.unwrap().unwrap();
        assert_eq!(job.job_type, "ping");
        assert_eq!(job.payload, json!({"source": "beat"}));
    }

    #[tokio::test]
    async fn downtime_collapses_into_one_fire() {
        let beat = beat("a").await;
        beat.register_entry_at(&every_minute(), t0()).await.unwrap();

        assert_eq!(beat.tick(t0()).await.unwrap().fired.len(), 1);
        assert_eq!(beat.tick(t0() + secs(60)).await.unwrap().fired.len(), 1);
        // Down from t0+60 to t0+176: the 120s slot was missed
        assert_eq!(beat.tick(t0() + secs(176)).await.unwrap().fired.len(), 1);
        let entry = beat.db().get_entry("heartbeat").await.unwrap().unwrap();
        assert_eq!(entry.next_fire_at, t0() + secs(180));
        assert_eq!(beat.tick(t0() + secs(180)).await.unwrap().fired.len(), 1);

        // Ten hours offline: still one fire
        assert_eq!(
            beat.tick(t0() + chrono::Duration::hours(10) + secs(5))
                .await
                .unwrap()
                .fired
                .len(),
            1
        );
        assert_eq!(beat.db().stats().await.unwrap().pending, 5);
    }

    #[tokio::test]
    async fn only_the_leader_fires() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let a = beat_with_db("a", db.clone()).await;
        let b = beat_with_db("b", db.clone()).await;
        a.register_entry_at(&every_minute(), t0()).await.unwrap();

        let ra = a.tick(t0()).await.unwrap();
        let rb = b.tick(t0()).await.unwrap();
        assert!(ra.leader && !rb.leader);
        assert_eq!(ra.fired.len() + rb.fired.len(), 1);
        assert!(a.is_leader());
        assert!(!b.is_leader());

        // Leader goes silent; after the TTL the other instance takes over
        let later = t0() + secs(90);
        let rb = b.tick(later).await.unwrap();
        assert!(rb.leader);
        assert_eq!(rb.fired.len(), 1);
        let ra = a.tick(later).await.unwrap();
        assert!(!ra.leader);
        assert!(!a.is_leader());
    }

    #[tokio::test]
    async fn shutdown_releases_lock() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let a = beat_with_db("a", db.clone()).await;
        let b = beat_with_db("b", db.clone()).await;

        assert!(a.tick(t0()).await.unwrap().leader);
        assert!(!b.tick(t0()).await.unwrap().leader);
        a.shutdown().await.unwrap();
        assert!(b.tick(t0() + secs(1)).await.unwrap().leader);
    }

    #[tokio::test]
    async fn reregistering_keeps_schedule_position() {
        let beat = beat("a").await;
        beat.register_entry_at(&every_minute(), t0()).await.unwrap();
        beat.tick(t0()).await.unwrap();

        // Process restart an hour later with the same definition
        let entry = beat
            .register_entry_at(&every_minute(), t0() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(entry.next_fire_at, t0() + secs(60));
        assert_eq!(entry.last_fired_at, Some(t0()));
    }

    #[tokio::test]
    async fn trigger_now_does_not_move_schedule() {
        let beat = beat("a").await;
        let def = ScheduleDefinition::new("archive", "archive_visits", "0 2 * * *".parse().unwrap());
        let entry = beat.register_entry_at(&def, t0()).await.unwrap();

        let job_id = beat.trigger_now("archive").await.unwrap();
        assert!(beat.db().get_job(job_id).await.unwrap().is_some());

        let after = beat.db().get_entry("archive").await.unwrap().unwrap();
        assert_eq!(after.next_fire_at, entry.next_fire_at);
        assert!(after.last_fired_at.is_some());

        assert!(matches!(
            beat.trigger_now("missing").await.unwrap_err(),
            ScheduleError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn disabled_entries_do_not_fire() {
        let beat = beat("a").await;
        beat.register_entry_at(&every_minute(), t0()).await.unwrap();
        beat.set_enabled("heartbeat", false).await.unwrap();
        assert!(beat.tick(t0()).await.unwrap().fired.is_empty());
        assert!(beat.set_enabled("nope", true).await.is_err());
    }

    /// Store that fails schedule writes or enqueues on demand.
    struct FlakyDb {
        inner: LibSqlBackend,
        fail_enqueue: AtomicBool,
        fail_claim: AtomicBool,
        fail_record: AtomicBool,
    }

    impl FlakyDb {
        async fn new() -> Self {
            Self {
                inner: LibSqlBackend::new_memory().await.unwrap(),
                fail_enqueue: AtomicBool::new(false),
                fail_claim: AtomicBool::new(false),
                fail_record: AtomicBool::new(false),
            }
        }

        fn down() -> DatabaseError {
            DatabaseError::Query("database is locked".to_string())
        }
    }

    #[async_trait]
    impl Broker for FlakyDb {
        async fn enqueue(&self, job: NewJob) -> Result<JobId, JobError> {
            if self.fail_enqueue.load(Ordering::SeqCst) {
                return Err(Self::down().into());
            }
            self.inner.enqueue(job).await
        }
        async fn dequeue(&self, worker_id: &str, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<Job>, JobError> {
            self.inner.dequeue(worker_id, batch_size, now).await
        }
        async fn ack(&self, id: JobId, worker_id: &str, output: serde_json::Value, now: DateTime<Utc>) -> Result<bool, JobError> {
            self.inner.ack(id, worker_id, output, now).await
        }
        async fn fail(&self, id: JobId, worker_id: &str, failure: JobFailure, now: DateTime<Utc>) -> Result<FailOutcome, JobError> {
            self.inner.fail(id, worker_id, failure, now).await
        }
        async fn mark_dead(&self, id: JobId, worker_id: &str, failure: JobFailure, now: DateTime<Utc>) -> Result<(), JobError> {
            self.inner.mark_dead(id, worker_id, failure, now).await
        }
        async fn extend_lease(&self, id: JobId, worker_id: &str, extend_by: Duration, now: DateTime<Utc>) -> Result<DateTime<Utc>, JobError> {
            self.inner.extend_lease(id, worker_id, extend_by, now).await
        }
        async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, JobError> {
            self.inner.cancel(id, now).await
        }
        async fn requeue_dead(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, JobError> {
            self.inner.requeue_dead(id, now).await
        }
        async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, JobError> {
            self.inner.reclaim_expired(now).await
        }
        async fn queue_depth(&self) -> Result<u64, JobError> {
            self.inner.queue_depth().await
        }
        async fn stats(&self) -> Result<QueueStats, JobError> {
            self.inner.stats().await
        }
    }

    #[async_trait]
    impl ResultStore for FlakyDb {
        async fn get_job(&self, id: JobId) -> Result<Option<Job>, DatabaseError> {
            self.inner.get_job(id).await
        }
        async fn list_by_type_and_state(&self, job_type: &str, state: JobState, range: TimeRange, limit: usize) -> Result<Vec<Job>, DatabaseError> {
            self.inner.list_by_type_and_state(job_type, state, range, limit).await
        }
        async fn list_attempts(&self, id: JobId) -> Result<Vec<AttemptRecord>, DatabaseError> {
            self.inner.list_attempts(id).await
        }
        async fn set_progress(&self, id: JobId, progress: &serde_json::Value, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
            self.inner.set_progress(id, progress, now).await
        }
        async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<usize, DatabaseError> {
            self.inner.purge_finished(older_than).await
        }
    }

    #[async_trait]
    impl ScheduleStore for FlakyDb {
        async fn upsert_entry(&self, entry: &ScheduleEntry) -> Result<(), DatabaseError> {
            self.inner.upsert_entry(entry).await
        }
        async fn get_entry(&self, name: &str) -> Result<Option<ScheduleEntry>, DatabaseError> {
            self.inner.get_entry(name).await
        }
        async fn list_entries(&self) -> Result<Vec<ScheduleEntry>, DatabaseError> {
            self.inner.list_entries().await
        }
        async fn list_due_entries(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>, DatabaseError> {
            self.inner.list_due_entries(now).await
        }
        async fn advance_entry(
            &self,
            name: &str,
            expected_next: DateTime<Utc>,
            next: DateTime<Utc>,
            fired_at: Option<DateTime<Utc>>,
        ) -> Result<bool, DatabaseError> {
            let moves = expected_next != next;
            if moves && self.fail_claim.load(Ordering::SeqCst) {
                return Err(Self::down());
            }
            if !moves && fired_at.is_some() && self.fail_record.load(Ordering::SeqCst) {
                return Err(Self::down());
            }
            self.inner.advance_entry(name, expected_next, next, fired_at).await
        }
        async fn set_entry_enabled(&self, name: &str, enabled: bool) -> Result<bool, DatabaseError> {
            self.inner.set_entry_enabled(name, enabled).await
        }
        async fn delete_entry(&self, name: &str) -> Result<bool, DatabaseError> {
            self.inner.delete_entry(name).await
        }
    }

    #[async_trait]
    impl LeaderLock for FlakyDb {
        async fn try_acquire_lock(&self, name: &str, holder: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
            self.inner.try_acquire_lock(name, holder, ttl, now).await
        }
        async fn release_lock(&self, name: &str, holder: &str) -> Result<bool, DatabaseError> {
            self.inner.release_lock(name, holder).await
        }
        async fn lock_holder(&self, name: &str, now: DateTime<Utc>) -> Result<Option<String>, DatabaseError> {
            self.inner.lock_holder(name, now).await
        }
    }

    async fn flaky_beat() -> (Beat, Arc<FlakyDb>) {
        let flaky = Arc::new(FlakyDb::new().await);
        let beat = beat_with_db("a", flaky.clone()).await;
        beat.register_entry_at(&every_minute(), t0()).await.unwrap();
        (beat, flaky)
    }

    #[tokio::test]
    async fn failed_claim_enqueues_nothing() {
        let (beat, flaky) = flaky_beat().await;
        flaky.fail_claim.store(true, Ordering::SeqCst);

        let report = beat.tick(t0()).await.unwrap();
        assert!(report.fired.is_empty());
        assert_eq!(report.failed, vec!["heartbeat".to_string()]);
        assert_eq!(beat.db().stats().await.unwrap().pending, 0);
        let entry = beat.db().get_entry("heartbeat").await.unwrap().unwrap();
        assert!(entry.is_due(t0()));

        flaky.fail_claim.store(false, Ordering::SeqCst);
        assert_eq!(beat.tick(t0() + secs(1)).await.unwrap().fired.len(), 1);
        assert!(beat.tick(t0() + secs(2)).await.unwrap().fired.is_empty());
        assert_eq!(beat.db().stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn failed_enqueue_puts_entry_back() {
        let (beat, flaky) = flaky_beat().await;
        flaky.fail_enqueue.store(true, Ordering::SeqCst);

        let report = beat.tick(t0()).await.unwrap();
        assert_eq!(report.failed, vec!["heartbeat".to_string()]);
        let entry = beat.db().get_entry("heartbeat").await.unwrap().unwrap();
        assert_eq!(entry.next_fire_at, t0());
        assert_eq!(entry.last_fired_at, None);

        flaky.fail_enqueue.store(false, Ordering::SeqCst);
        assert_eq!(beat.tick(t0() + secs(1)).await.unwrap().fired.len(), 1);
        assert_eq!(beat.db().stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn failed_fire_time_write_still_fires_once() {
        let (beat, flaky) = flaky_beat().await;
        flaky.fail_record.store(true, Ordering::SeqCst);

        let report = beat.tick(t0()).await.unwrap();
        assert_eq!(report.fired.len(), 1);
        assert!(report.failed.is_empty());
        let entry = beat.db().get_entry("heartbeat").await.unwrap().unwrap();
        assert_eq!(entry.next_fire_at, t0() + secs(60));
        assert_eq!(entry.last_fired_at, None);

        // The slot is already claimed, so later ticks do not repeat it
        assert!(beat.tick(t0() + secs(1)).await.unwrap().fired.is_empty());
        assert_eq!(beat.db().stats().await.unwrap().pending, 1);
    }

    #[test]
    fn retention_adds_purge_entry() {
        let mut config = config();
        assert!(configured_definitions(&config).unwrap().is_empty());

        config.retention = Some(Duration::from_secs(7 * 86_400));
        let defs = configured_definitions(&config).unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].job_type, PURGE_FINISHED);
    }
}
