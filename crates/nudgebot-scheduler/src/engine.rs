//! Scheduler Engine — arms triggers, fires due jobs, closes out task records.
//!
//! One instance per process: construct it at startup, register handlers,
//! call `restore_on_startup`, then `start`. `shutdown` stops the tick loop and
//! waits for in-flight jobs.
//!
//! Short-lived admin processes may share the database file. They call
//! `reload_from_store` instead of restoring; the running daemon picks up their
//! writes on its next tick.
//!
//! Every execution closes the current PENDING record and, for recurring jobs,
//! inserts the successor in the same transaction, so exactly one PENDING
//! record exists per recurring job afterward. Missed firings are coalesced:
//! a late trigger runs once, and one later than `misfire_grace_secs` is skipped.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use nudgebot_core::config::SchedulerConfig;
use nudgebot_core::error::{NudgeError, Result};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::handler::{HandlerRegistry, JobHandler};
use crate::persistence::{SchedulerDb, TriggerKind, TriggerRow, TriggerWrite};
use crate::pool::{PoolStats, RunSlot, WorkerPool};
use crate::tasks::{JobSpec, TaskRecord, TaskStatus, TaskType};

/// A trigger armed in this process.
#[derive(Clone)]
struct LiveTrigger {
    kind: TriggerKind,
    next_fire_at: DateTime<Utc>,
    spec: JobSpec,
    handler: Arc<dyn JobHandler>,
}

impl LiveTrigger {
    fn row(&self, job_key: &str) -> TriggerRow {
        TriggerRow {
            job_key: job_key.to_string(),
            kind: self.kind,
            next_fire_at: self.next_fire_at,
            spec: self.spec.clone(),
        }
    }
}

/// Admin view of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub job_key: String,
    /// "recurring" or "one_shot"; `None` when only a PENDING record exists.
    pub kind: Option<&'static str>,
    pub interval_secs: Option<i64>,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub task_type: TaskType,
    /// A live trigger exists in this process.
    pub armed: bool,
    pub running: bool,
    pub pending: Option<TaskRecord>,
}

/// What `restore_on_startup` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub rearmed_recurring: usize,
    pub rearmed_one_shots: usize,
    pub missed_one_shots: usize,
    /// Occurrences found EXECUTING and closed FAILED.
    pub interrupted: usize,
    /// Persisted work left untouched because no handler is registered for it.
    pub skipped_no_handler: usize,
}

struct Inner {
    db: Mutex<SchedulerDb>,
    triggers: Mutex<HashMap<String, LiveTrigger>>,
    registry: HandlerRegistry,
    pool: WorkerPool,
    config: SchedulerConfig,
    shutdown: watch::Sender<bool>,
}

/// The task scheduler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    m.lock()
        .map_err(|_| NudgeError::Internal(format!("{what} mutex is poisoned")))
}

fn kind_label(kind: TriggerKind) -> (&'static str, Option<i64>) {
    match kind {
        TriggerKind::Recurring { interval_secs } => ("recurring", Some(interval_secs)),
        TriggerKind::OneShot => ("one_shot", None),
    }
}

impl TaskScheduler {
    pub fn new(db: SchedulerDb, config: SchedulerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                db: Mutex::new(db),
                triggers: Mutex::new(HashMap::new()),
                registry: HandlerRegistry::default(),
                pool: WorkerPool::new(config.max_workers),
                config,
                shutdown,
            }),
        }
    }

    fn db(&self) -> Result<MutexGuard<'_, SchedulerDb>> {
        lock(&self.inner.db, "scheduler db")
    }

    fn triggers(&self) -> Result<MutexGuard<'_, HashMap<String, LiveTrigger>>> {
        lock(&self.inner.triggers, "trigger table")
    }

    /// Register the handler used for one-shots and restored triggers of `task_type`.
    pub fn register_handler(&self, task_type: TaskType, handler: Arc<dyn JobHandler>) {
        self.inner.registry.register(task_type, handler);
    }

    pub fn handler_for(&self, task_type: TaskType) -> Option<Arc<dyn JobHandler>> {
        self.inner.registry.get(task_type)
    }

    // ─── Arming ──────────────────────────────────────

    pub fn schedule_recurring(
        &self,
        job_name: &str,
        interval: Duration,
        spec: JobSpec,
        handler: Arc<dyn JobHandler>,
    ) -> Result<TaskRecord> {
        self.schedule_recurring_at(job_name, interval, spec, handler, Utc::now())
    }

    /// Cancel-and-replace: any trigger under `job_name` is swapped out and any stale
    /// PENDING record deleted before the next occurrence at `now + interval` is stored.
    pub fn schedule_recurring_at(
        &self,
        job_name: &str,
        interval: Duration,
        spec: JobSpec,
        handler: Arc<dyn JobHandler>,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord> {
        if job_name.trim().is_empty() {
            return Err(NudgeError::Validation("job name must not be empty".into()));
        }
        let interval_secs = interval.num_seconds();
        if interval_secs < 1 {
            return Err(NudgeError::Validation(format!(
                "interval for '{job_name}' must be at least one second"
            )));
        }

        let next_fire_at = now + Duration::seconds(interval_secs);
        let record = TaskRecord::recurring(job_name, &spec, next_fire_at, now);
        let live = LiveTrigger {
            kind: TriggerKind::Recurring { interval_secs },
            next_fire_at,
            spec,
            handler: handler.clone(),
        };

        let mut triggers = self.triggers()?;
        let replaced = triggers.remove(job_name).is_some();
        let stale = self
            .db()?
            .replace_pending(job_name, &record, &live.row(job_name))?;
        if self.inner.registry.get(live.spec.task_type).is_none() {
            self.inner.registry.register(live.spec.task_type, handler);
        }
        triggers.insert(job_name.to_string(), live);

        tracing::info!(
            "📅 Recurring job '{}' armed every {}s, next at {} (replaced: {}, stale pending removed: {})",
            job_name,
            interval_secs,
            next_fire_at,
            replaced,
            stale
        );
        Ok(record)
    }

    pub fn schedule_once(&self, run_at: DateTime<Utc>, spec: JobSpec) -> Result<TaskRecord> {
        self.schedule_once_at(run_at, spec, Utc::now())
    }

    /// Arm a one-shot trigger. The handler comes from the registry so the job can be
    /// re-armed after a restart.
    pub fn schedule_once_at(
        &self,
        run_at: DateTime<Utc>,
        spec: JobSpec,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord> {
        let handler = self.inner.registry.get(spec.task_type).ok_or_else(|| {
            NudgeError::Validation(format!("no handler registered for {}", spec.task_type))
        })?;
        let record = TaskRecord::one_shot(&spec, run_at, now);
        self.arm_one_shot(&record, handler, true)?;
        tracing::info!(
            "📅 One-shot {} ({}) armed for {}",
            record.job_id,
            record.task_type,
            run_at
        );
        Ok(record)
    }

    fn arm_one_shot(&self, record: &TaskRecord, handler: Arc<dyn JobHandler>, insert: bool) -> Result<()> {
        let live = LiveTrigger {
            kind: TriggerKind::OneShot,
            next_fire_at: record.scheduled_at,
            spec: record.spec(),
            handler,
        };
        let mut triggers = self.triggers()?;
        {
            let db = self.db()?;
            let row = live.row(&record.job_id);
            if insert {
                db.insert_with_trigger(record, &row)?;
            } else {
                db.upsert_trigger(&row)?;
            }
        }
        triggers.insert(record.job_id.clone(), live);
        Ok(())
    }

    // ─── Restore ──────────────────────────────────────

    pub fn restore_on_startup(&self) -> Result<RestoreReport> {
        self.restore_on_startup_at(Utc::now())
    }

    /// Re-arm persisted work after a restart.
    ///
    /// - EXECUTING records left by a crash are closed FAILED ("interrupted by restart").
    /// - PENDING one-shots in the past are closed FAILED ("missed due to restart").
    /// - PENDING one-shots in the future get a live trigger at their stored time.
    /// - Persisted recurring triggers are re-armed at their stored next fire time.
    pub fn restore_on_startup_at(&self, now: DateTime<Utc>) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();
        let mut triggers = self.triggers()?;
        let db = self.db()?;
        let persisted = db.load_triggers()?;

        for mut rec in db.executing_records()? {
            rec.fail(now, "interrupted by restart", serde_json::json!({}))?;
            let write = if rec.is_one_shot() {
                TriggerWrite::Delete(&rec.job_id)
            } else {
                TriggerWrite::Keep
            };
            db.finish_occurrence(&rec, None, write)?;
            tracing::warn!(
                "⚠️ Job '{}' ({}) was interrupted by restart",
                rec.trigger_key(),
                rec.id
            );
            report.interrupted += 1;
        }

        for row in persisted.iter().filter(|r| matches!(r.kind, TriggerKind::Recurring { .. })) {
            if triggers.contains_key(&row.job_key) {
                continue;
            }
            let Some(handler) = self.inner.registry.get(row.spec.task_type) else {
                tracing::warn!(
                    "⚠️ No handler for {}: recurring job '{}' not restored",
                    row.spec.task_type,
                    row.job_key
                );
                report.skipped_no_handler += 1;
                continue;
            };
            if db.pending_for_name(&row.job_key)?.is_none() {
                let rec = TaskRecord::recurring(&row.job_key, &row.spec, row.next_fire_at, now);
                db.insert_record(&rec)?;
            }
            triggers.insert(
                row.job_key.clone(),
                LiveTrigger {
                    kind: row.kind,
                    next_fire_at: row.next_fire_at,
                    spec: row.spec.clone(),
                    handler,
                },
            );
            report.rearmed_recurring += 1;
        }

        for mut rec in db.pending_one_shots()? {
            if rec.scheduled_at < now {
                let reason = format!(
                    "missed due to restart: was scheduled for {}",
                    rec.scheduled_at.to_rfc3339()
                );
                rec.mark_missed(now, &reason)?;
                db.finish_occurrence(&rec, None, TriggerWrite::Delete(&rec.job_id))?;
                tracing::warn!("⏭️ One-shot {} {}", rec.job_id, reason);
                report.missed_one_shots += 1;
                continue;
            }
            let Some(handler) = self.inner.registry.get(rec.task_type) else {
                tracing::warn!(
                    "⚠️ No handler for {}: one-shot {} left pending",
                    rec.task_type,
                    rec.job_id
                );
                report.skipped_no_handler += 1;
                continue;
            };
            let live = LiveTrigger {
                kind: TriggerKind::OneShot,
                next_fire_at: rec.scheduled_at,
                spec: rec.spec(),
                handler,
            };
            db.upsert_trigger(&live.row(&rec.job_id))?;
            triggers.insert(rec.job_id.clone(), live);
            report.rearmed_one_shots += 1;
        }

        // One-shot trigger rows whose record is gone or already closed.
        for row in persisted.iter().filter(|r| r.kind == TriggerKind::OneShot) {
            if !triggers.contains_key(&row.job_key) && db.pending_for_key(&row.job_key)?.is_none() {
                db.delete_trigger(&row.job_key)?;
            }
        }

        tracing::info!(
            "🔄 Scheduler restored: {} recurring, {} one-shot re-armed, {} missed, {} interrupted, {} without handler",
            report.rearmed_recurring,
            report.rearmed_one_shots,
            report.missed_one_shots,
            report.interrupted,
            report.skipped_no_handler
        );
        Ok(report)
    }

    /// Bring the live trigger table in line with `scheduler_triggers`.
    ///
    /// Rows written by another process are armed when a PENDING record backs them;
    /// live triggers whose row is gone are dropped unless running. Unlike a restore,
    /// nothing is marked missed.
    pub fn reload_from_store(&self) -> Result<()> {
        let mut triggers = self.triggers()?;
        let db = self.db()?;
        let persisted: HashMap<String, TriggerRow> = db
            .load_triggers()?
            .into_iter()
            .map(|row| (row.job_key.clone(), row))
            .collect();

        let gone: Vec<String> = triggers
            .keys()
            .filter(|k| !persisted.contains_key(*k) && !self.inner.pool.is_running(k))
            .cloned()
            .collect();
        for key in gone {
            triggers.remove(&key);
            tracing::info!("🛑 Job '{}' was cancelled elsewhere, disarmed", key);
        }

        for (key, row) in persisted {
            if let Some(live) = triggers.get_mut(&key) {
                live.kind = row.kind;
                live.next_fire_at = row.next_fire_at;
                live.spec = row.spec;
                continue;
            }
            if db.pending_for_key(&key)?.is_none() {
                continue;
            }
            let Some(handler) = self.inner.registry.get(row.spec.task_type) else {
                tracing::debug!("No handler for {}: job '{}' left unarmed", row.spec.task_type, key);
                continue;
            };
            tracing::info!("📅 Job '{}' armed from store for {}", key, row.next_fire_at);
            triggers.insert(
                key,
                LiveTrigger {
                    kind: row.kind,
                    next_fire_at: row.next_fire_at,
                    spec: row.spec,
                    handler,
                },
            );
        }
        Ok(())
    }

    // ─── Admin ──────────────────────────────────────

    /// Remove the live trigger and mark the PENDING record CANCELLED.
    /// In-flight executions finish; a cancelled recurring job gets no successor.
    pub fn cancel(&self, job_key: &str) -> Result<Option<TaskRecord>> {
        let mut triggers = self.triggers()?;
        let was_live = triggers.remove(job_key).is_some();
        let (cancelled, had_row) = self.db()?.cancel_job(job_key, "cancelled")?;
        if !was_live && !had_row && cancelled.is_none() {
            return Err(NudgeError::NotFound(format!("job '{job_key}'")));
        }
        tracing::info!("🛑 Job '{}' cancelled", job_key);
        Ok(cancelled)
    }

    pub fn get_info(&self, job_key: &str) -> Result<JobInfo> {
        let live = self.triggers()?.get(job_key).cloned();
        let pending = self.db()?.pending_for_key(job_key)?;
        self.build_info(job_key, live.as_ref(), pending)
            .ok_or_else(|| NudgeError::NotFound(format!("job '{job_key}'")))
    }

    pub fn list_jobs(&self) -> Result<Vec<JobInfo>> {
        let live: Vec<(String, LiveTrigger)> = self
            .triggers()?
            .iter()
            .map(|(k, t)| (k.clone(), t.clone()))
            .collect();
        let mut out = Vec::with_capacity(live.len());
        for (key, trig) in live {
            let pending = self.db()?.pending_for_key(&key)?;
            if let Some(info) = self.build_info(&key, Some(&trig), pending) {
                out.push(info);
            }
        }
        out.sort_by_key(|i| i.next_fire_at);
        Ok(out)
    }

    fn build_info(
        &self,
        job_key: &str,
        live: Option<&LiveTrigger>,
        pending: Option<TaskRecord>,
    ) -> Option<JobInfo> {
        let task_type = live
            .map(|t| t.spec.task_type)
            .or_else(|| pending.as_ref().map(|p| p.task_type))?;
        let (kind, interval_secs) = match live {
            Some(t) => {
                let (k, i) = kind_label(t.kind);
                (Some(k), i)
            }
            None => (None, None),
        };
        Some(JobInfo {
            job_key: job_key.to_string(),
            kind,
            interval_secs,
            next_fire_at: live
                .map(|t| t.next_fire_at)
                .or_else(|| pending.as_ref().map(|p| p.scheduled_at)),
            task_type,
            armed: live.is_some(),
            running: self.inner.pool.is_running(job_key),
            pending,
        })
    }

    pub fn recent_records(&self, limit: usize) -> Result<Vec<TaskRecord>> {
        self.db()?.recent_records(limit)
    }

    pub fn records_for(&self, job_name: &str) -> Result<Vec<TaskRecord>> {
        self.db()?.records_for_name(job_name)
    }

    /// Drop terminal records older than `cutoff`.
    pub fn prune_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.db()?.prune_finished_before(cutoff)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    // ─── Firing ──────────────────────────────────────

    /// Dispatch every due trigger onto the worker pool. Returns the spawned tasks.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        if let Err(e) = self.reload_from_store() {
            tracing::error!("Scheduler could not reload triggers: {e}");
        }
        let due: Vec<(String, LiveTrigger)> = match self.triggers() {
            Ok(map) => map
                .iter()
                .filter(|(_, t)| t.next_fire_at <= now)
                .map(|(k, t)| (k.clone(), t.clone()))
                .collect(),
            Err(e) => {
                tracing::error!("Scheduler tick failed: {e}");
                return Vec::new();
            }
        };

        let grace = Duration::seconds(self.inner.config.misfire_grace_secs as i64);
        let mut spawned = Vec::new();
        for (key, trig) in due {
            let Some(slot) = self.inner.pool.try_claim(&key) else {
                tracing::debug!("⏳ Job '{}' still running, firing coalesced", key);
                continue;
            };
            if now - trig.next_fire_at > grace {
                if let Err(e) = self.skip_missed(&key, &trig, now) {
                    tracing::error!("Failed to skip missed job '{}': {e}", key);
                }
                continue;
            }
            let this = self.clone();
            spawned.push(tokio::spawn(async move {
                let key = slot.key().to_string();
                if let Err(e) = this.execute(slot, now).await {
                    tracing::error!("❌ Job '{}' could not run: {e}", key);
                }
            }));
        }
        spawned
    }

    /// Run `job_key` immediately as if its trigger fired at `now`.
    pub async fn run_job_at(&self, job_key: &str, now: DateTime<Utc>) -> Result<TaskRecord> {
        let slot = self
            .inner
            .pool
            .try_claim(job_key)
            .ok_or_else(|| NudgeError::Validation(format!("job '{job_key}' is already running")))?;
        self.execute(slot, now).await
    }

    /// Run `spec` once right now and return its closed record.
    ///
    /// The occurrence gets a record but no persisted trigger, so a daemon sharing
    /// the database never fires it a second time.
    pub async fn run_now_at(&self, spec: JobSpec, now: DateTime<Utc>) -> Result<TaskRecord> {
        let handler = self.inner.registry.get(spec.task_type).ok_or_else(|| {
            NudgeError::Validation(format!("no handler registered for {}", spec.task_type))
        })?;
        let record = TaskRecord::one_shot(&spec, now, now);
        let slot = self
            .inner
            .pool
            .try_claim(&record.job_id)
            .ok_or_else(|| NudgeError::Internal(format!("job '{}' is already running", record.job_id)))?;
        {
            let mut triggers = self.triggers()?;
            self.db()?.insert_record(&record)?;
            triggers.insert(
                record.job_id.clone(),
                LiveTrigger {
                    kind: TriggerKind::OneShot,
                    next_fire_at: now,
                    spec,
                    handler,
                },
            );
        }
        tracing::info!("▶️ Ad-hoc {} run as {}", record.task_type, record.job_id);
        self.execute(slot, now).await
    }

    /// A firing beyond the grace period: close it without running.
    fn skip_missed(&self, key: &str, trig: &LiveTrigger, now: DateTime<Utc>) -> Result<()> {
        let reason = format!(
            "missed: due at {} exceeded the {}s grace period",
            trig.next_fire_at.to_rfc3339(),
            self.inner.config.misfire_grace_secs
        );
        let mut triggers = self.triggers()?;
        let db = self.db()?;
        let pending = db.pending_for_key(key)?;

        match trig.kind {
            TriggerKind::Recurring { interval_secs } => {
                let next_at = now + Duration::seconds(interval_secs);
                let successor = TaskRecord::recurring(key, &trig.spec, next_at, now);
                let mut next = trig.clone();
                next.next_fire_at = next_at;
                let row = next.row(key);
                match pending {
                    Some(mut rec) => {
                        rec.cancel(&reason)?;
                        db.finish_occurrence(&rec, Some(&successor), TriggerWrite::Upsert(&row))?;
                    }
                    None => {
                        db.insert_record(&successor)?;
                        db.upsert_trigger(&row)?;
                    }
                }
                triggers.insert(key.to_string(), next);
                tracing::warn!("⏭️ Recurring job '{}' {}; next at {}", key, reason, next_at);
            }
            TriggerKind::OneShot => {
                triggers.remove(key);
                match pending {
                    Some(mut rec) => {
                        rec.mark_missed(now, &reason)?;
                        db.finish_occurrence(&rec, None, TriggerWrite::Delete(key))?;
                    }
                    None => {
                        db.delete_trigger(key)?;
                    }
                }
                tracing::warn!("⏭️ One-shot {} {}", key, reason);
            }
        }
        Ok(())
    }

    /// Delivery gets the send budget; generative jobs get the generation budget on top.
    fn budget_for(&self, task_type: TaskType) -> std::time::Duration {
        let config = &self.inner.config;
        let secs = if task_type.is_generative() {
            config
                .generation_timeout_secs
                .saturating_add(config.dm_timeout_secs)
        } else {
            config.dm_timeout_secs
        };
        std::time::Duration::from_secs(secs.max(1))
    }

    async fn execute(&self, slot: RunSlot, fire_at: DateTime<Utc>) -> Result<TaskRecord> {
        let key = slot.key().to_string();
        let trig = self
            .triggers()?
            .get(&key)
            .cloned()
            .ok_or_else(|| NudgeError::NotFound(format!("job '{key}'")))?;

        let _permit = self
            .inner
            .pool
            .acquire()
            .await
            .ok_or_else(|| NudgeError::Internal("scheduler is shutting down".into()))?;

        let mut record = {
            let db = self.db()?;
            let mut rec = match db.pending_for_key(&key)? {
                Some(rec) => rec,
                None if !db.has_trigger(&key)? => {
                    drop(db);
                    self.triggers()?.remove(&key);
                    return Err(NudgeError::NotFound(format!("job '{key}' is no longer scheduled")));
                }
                None if matches!(trig.kind, TriggerKind::Recurring { .. }) => {
                    tracing::warn!("⚠️ Job '{}' had no pending record, creating one", key);
                    let rec = TaskRecord::recurring(&key, &trig.spec, fire_at, fire_at);
                    db.insert_record(&rec)?;
                    rec
                }
                None => {
                    drop(db);
                    self.triggers()?.remove(&key);
                    return Err(NudgeError::NotFound(format!("pending record for '{key}'")));
                }
            };
            rec.start_executing()?;
            db.update_record(&rec)?;
            rec
        };

        tracing::info!("▶️ Running job '{}' ({}, {})", key, record.job_id, record.task_type);
        let budget = self.budget_for(record.task_type);
        let started = Instant::now();
        let run = AssertUnwindSafe(trig.handler.run(&record)).catch_unwind();
        let outcome = match tokio::time::timeout(budget, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NudgeError::Internal(format!("handler for '{key}' panicked"))),
            Err(_) => Err(NudgeError::Timeout(format!(
                "job '{key}' exceeded its {}s budget",
                budget.as_secs()
            ))),
        };
        let finished_at = fire_at + Duration::from_std(started.elapsed()).unwrap_or_else(|_| Duration::zero());

        match outcome {
            Ok(result) => {
                record.complete(finished_at, result)?;
                tracing::info!("✅ Job '{}' completed", key);
            }
            Err(e) => {
                let message = e.to_string();
                record.fail(finished_at, &message, serde_json::json!({}))?;
                tracing::warn!("⚠️ Job '{}' failed: {}", key, message);
            }
        }

        self.finalize(&key, &trig, record, fire_at, finished_at)
    }

    /// Persist the terminal record and arm what comes next, atomically.
    fn finalize(
        &self,
        key: &str,
        trig: &LiveTrigger,
        record: TaskRecord,
        fire_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<TaskRecord> {
        let mut triggers = self.triggers()?;
        let db = self.db()?;

        match trig.kind {
            TriggerKind::Recurring { interval_secs } => {
                let still_armed = triggers.contains_key(key);
                // A reschedule during the run already stored a fresh PENDING.
                let rescheduled = db.pending_for_name(key)?.is_some();
                if still_armed && !rescheduled {
                    let next_at = fire_at + Duration::seconds(interval_secs);
                    let successor = TaskRecord::recurring(key, &trig.spec, next_at, finished_at);
                    let mut next = trig.clone();
                    next.next_fire_at = next_at;
                    db.finish_occurrence(&record, Some(&successor), TriggerWrite::Upsert(&next.row(key)))?;
                    if let Some(live) = triggers.get_mut(key) {
                        live.next_fire_at = next_at;
                    }
                    tracing::debug!("📅 Job '{}' next occurrence at {}", key, next_at);
                } else {
                    db.finish_occurrence(&record, None, TriggerWrite::Keep)?;
                }
            }
            TriggerKind::OneShot => {
                triggers.remove(key);
                let retries_left = record.retry_count < self.inner.config.one_shot_max_retries;
                if record.status == TaskStatus::Failed && retries_left {
                    let backoff = Duration::seconds(self.inner.config.retry_backoff_secs as i64);
                    let mut spec = record.spec();
                    if let Some(meta) = spec.metadata.as_object_mut() {
                        meta.insert("retry_of".into(), serde_json::json!(record.job_id));
                    }
                    let mut retry = TaskRecord::one_shot(&spec, finished_at + backoff, finished_at);
                    retry.retry_count = record.retry_count + 1;
                    let live = LiveTrigger {
                        kind: TriggerKind::OneShot,
                        next_fire_at: retry.scheduled_at,
                        spec,
                        handler: trig.handler.clone(),
                    };
                    db.finish_occurrence(
                        &record,
                        Some(&retry),
                        TriggerWrite::Replace {
                            upsert: &live.row(&retry.job_id),
                            delete: key,
                        },
                    )?;
                    tracing::info!(
                        "🔁 One-shot {} retry {} armed for {}",
                        key,
                        retry.retry_count,
                        retry.scheduled_at
                    );
                    triggers.insert(retry.job_id.clone(), live);
                } else {
                    db.finish_occurrence(&record, None, TriggerWrite::Delete(key))?;
                }
            }
        }
        Ok(record)
    }

    // ─── Lifecycle ──────────────────────────────────────

    /// Spawn the tick loop as a background tokio task.
    pub fn start(&self) -> JoinHandle<()> {
        let this = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let tick_ms = self.inner.config.tick_ms.max(10);
        tokio::spawn(async move {
            tracing::info!(
                "⏰ Scheduler started (tick every {}ms, {} workers)",
                tick_ms,
                this.inner.pool.stats().max_workers
            );
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(tick_ms));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        this.tick_at(Utc::now());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("⏹️ Scheduler loop stopped");
        })
    }

    /// Stop firing new jobs and wait for in-flight ones to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.pool.drain().await;
        tracing::info!("⏹️ Scheduler drained");
    }
}
