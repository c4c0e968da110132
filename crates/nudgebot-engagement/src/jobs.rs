//! Concrete scheduler jobs, registered at startup.
//!
//! | Job name          | Task type              | Cadence                        |
//! |-------------------|------------------------|--------------------------------|
//! | `random-dm-cycle` | `recurring_dm`         | `random_dm_interval_hours`     |
//! | `img-post`        | `recurring_image_post` | `image_post_interval_days`     |
//! | `cleanup`         | `cleanup`              | daily                          |
//! | `once-…`          | `one_shot_reminder`    | at an absolute time            |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nudgebot_core::config::{ConfigSource, EngagementSettings};
use nudgebot_core::error::{NudgeError, Result};
use nudgebot_core::traits::{Gateway, Responder};
use nudgebot_scheduler::{JobHandler, JobSpec, TargetType, TaskRecord, TaskScheduler, TaskType};

use crate::messenger::ProactiveMessenger;
use crate::store::EngagementDb;

pub const RANDOM_DM_JOB: &str = "random-dm-cycle";
pub const IMAGE_POST_JOB: &str = "img-post";
pub const CLEANUP_JOB: &str = "cleanup";

/// One proactive DM per firing. Runs marked `manual` ignore `random_dm_enabled`.
pub struct ProactiveDmJob {
    messenger: Arc<ProactiveMessenger>,
    config: Arc<dyn ConfigSource>,
}

#[async_trait]
impl JobHandler for ProactiveDmJob {
    async fn run(&self, record: &TaskRecord) -> Result<serde_json::Value> {
        let manual = record.metadata.get("manual").and_then(|m| m.as_bool()) == Some(true);
        if !manual && !EngagementSettings::load(self.config.as_ref()).random_dm_enabled {
            return Ok(serde_json::json!({"skipped": "random_dm_disabled"}));
        }
        let report = self.messenger.send_proactive().await?;
        serde_json::to_value(report).map_err(|e| NudgeError::Internal(e.to_string()))
    }
}

/// Delivers `metadata.message` to the target user's DM.
pub struct ReminderJob {
    gateway: Arc<dyn Gateway>,
}

#[async_trait]
impl JobHandler for ReminderJob {
    async fn run(&self, record: &TaskRecord) -> Result<serde_json::Value> {
        let message = record
            .metadata
            .get("message")
            .and_then(|m| m.as_str())
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| NudgeError::Validation(format!("reminder {} has no message", record.job_id)))?;
        let channel_id = self.gateway.open_direct_channel(&record.target_id).await?;
        let sent = self.gateway.send_message(&channel_id, message, None).await?;
        tracing::info!("⏰ Reminder {} delivered to {}", record.job_id, record.target_id);
        Ok(serde_json::json!({"channel_id": sent.channel_id, "message_ts": sent.ts}))
    }
}

/// Posts Responder-composed content to a channel.
pub struct ChannelPostJob {
    gateway: Arc<dyn Gateway>,
    responder: Arc<dyn Responder>,
    config: Arc<dyn ConfigSource>,
}

#[async_trait]
impl JobHandler for ChannelPostJob {
    async fn run(&self, record: &TaskRecord) -> Result<serde_json::Value> {
        let channel = if record.target_id.is_empty() {
            EngagementSettings::load(self.config.as_ref())
                .image_post_channel
                .ok_or_else(|| NudgeError::Config("engagement.image_post_channel is not set".into()))?
        } else {
            record.target_id.clone()
        };
        let content = self.responder.compose_channel_post().await?;
        let sent = self.gateway.send_message(&channel, &content, None).await?;
        tracing::info!("🖼️ Channel post delivered to {}", channel);
        Ok(serde_json::json!({"channel_id": sent.channel_id, "message_ts": sent.ts}))
    }
}

/// Prunes terminal task records and audit events past retention.
pub struct CleanupJob {
    scheduler: TaskScheduler,
    store: Arc<EngagementDb>,
    config: Arc<dyn ConfigSource>,
}

#[async_trait]
impl JobHandler for CleanupJob {
    async fn run(&self, _record: &TaskRecord) -> Result<serde_json::Value> {
        let days = EngagementSettings::load(self.config.as_ref()).retention_days;
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        let records = self.scheduler.prune_finished_before(cutoff)?;
        let events = self.store.prune_events_before(cutoff)?;
        tracing::info!(
            "🧹 Cleanup removed {} task records and {} audit events older than {} days",
            records,
            events,
            days
        );
        Ok(serde_json::json!({"pruned_records": records, "pruned_events": events}))
    }
}

/// Collaborators shared by the job handlers.
#[derive(Clone)]
pub struct JobDeps {
    pub gateway: Arc<dyn Gateway>,
    pub responder: Arc<dyn Responder>,
    pub store: Arc<EngagementDb>,
    pub messenger: Arc<ProactiveMessenger>,
    pub config: Arc<dyn ConfigSource>,
}

/// Register a handler for every task type. Call before `restore_on_startup`.
pub fn register_handlers(scheduler: &TaskScheduler, deps: &JobDeps) {
    scheduler.register_handler(
        TaskType::RecurringDm,
        Arc::new(ProactiveDmJob {
            messenger: deps.messenger.clone(),
            config: deps.config.clone(),
        }),
    );
    scheduler.register_handler(
        TaskType::OneShotReminder,
        Arc::new(ReminderJob {
            gateway: deps.gateway.clone(),
        }),
    );
    scheduler.register_handler(
        TaskType::RecurringImagePost,
        Arc::new(ChannelPostJob {
            gateway: deps.gateway.clone(),
            responder: deps.responder.clone(),
            config: deps.config.clone(),
        }),
    );
    scheduler.register_handler(
        TaskType::Cleanup,
        Arc::new(CleanupJob {
            scheduler: scheduler.clone(),
            store: deps.store.clone(),
            config: deps.config.clone(),
        }),
    );
}

/// Arm the recurring jobs the settings ask for. A job already armed with the same
/// interval (e.g. restored from the trigger table) keeps its next fire time.
pub fn arm_default_jobs(scheduler: &TaskScheduler, deps: &JobDeps, now: DateTime<Utc>) -> Result<Vec<String>> {
    let settings = EngagementSettings::load(deps.config.as_ref());
    let mut armed = Vec::new();

    if settings.random_dm_enabled {
        let spec = JobSpec::new(TaskType::RecurringDm, TargetType::User, "random");
        let interval = chrono::Duration::hours(settings.random_dm_interval_hours as i64);
        ensure_recurring(scheduler, RANDOM_DM_JOB, interval, spec, now)?;
        armed.push(RANDOM_DM_JOB.to_string());
    } else {
        disarm(scheduler, RANDOM_DM_JOB)?;
    }

    match &settings.image_post_channel {
        Some(channel) => {
            let spec = JobSpec::new(TaskType::RecurringImagePost, TargetType::Channel, channel);
            let interval = chrono::Duration::days(settings.image_post_interval_days as i64);
            ensure_recurring(scheduler, IMAGE_POST_JOB, interval, spec, now)?;
            armed.push(IMAGE_POST_JOB.to_string());
        }
        None => disarm(scheduler, IMAGE_POST_JOB)?,
    }

    let spec = JobSpec::new(TaskType::Cleanup, TargetType::System, "system");
    ensure_recurring(scheduler, CLEANUP_JOB, chrono::Duration::days(1), spec, now)?;
    armed.push(CLEANUP_JOB.to_string());

    Ok(armed)
}

fn ensure_recurring(
    scheduler: &TaskScheduler,
    job_name: &str,
    interval: chrono::Duration,
    spec: JobSpec,
    now: DateTime<Utc>,
) -> Result<()> {
    if let Ok(info) = scheduler.get_info(job_name) {
        let same_target = info.pending.as_ref().is_none_or(|p| p.target_id == spec.target_id);
        if info.armed && info.interval_secs == Some(interval.num_seconds()) && same_target {
            tracing::debug!("Job '{}' already armed, keeping next fire time", job_name);
            return Ok(());
        }
    }
    let handler = scheduler
        .handler_for(spec.task_type)
        .ok_or_else(|| NudgeError::Validation(format!("no handler registered for {}", spec.task_type)))?;
    scheduler.schedule_recurring_at(job_name, interval, spec, handler, now)?;
    Ok(())
}

fn disarm(scheduler: &TaskScheduler, job_name: &str) -> Result<()> {
    match scheduler.cancel(job_name) {
        Ok(_) => {
            tracing::info!("Job '{}' disabled by configuration", job_name);
            Ok(())
        }
        Err(NudgeError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Reminder helper used by the CLI.
pub fn schedule_reminder(
    scheduler: &TaskScheduler,
    user_id: &str,
    run_at: DateTime<Utc>,
    message: &str,
    now: DateTime<Utc>,
) -> Result<TaskRecord> {
    if message.trim().is_empty() {
        return Err(NudgeError::Validation("reminder message must not be empty".into()));
    }
    let spec = JobSpec::new(TaskType::OneShotReminder, TargetType::User, user_id)
        .with_metadata(serde_json::json!({"message": message}));
    scheduler.schedule_once_at(run_at, spec, now)
}

/// One proactive DM right now, closed out as its own task record.
pub async fn send_dm_now(scheduler: &TaskScheduler, now: DateTime<Utc>) -> Result<TaskRecord> {
    let spec = JobSpec::new(TaskType::RecurringDm, TargetType::User, "random")
        .with_metadata(serde_json::json!({"manual": true}));
    scheduler.run_now_at(spec, now).await
}

/// Budgets applied to collaborator calls made from jobs and the monitor.
pub fn timeouts(config: &nudgebot_core::config::SchedulerConfig) -> (Duration, Duration) {
    (
        Duration::from_secs(config.dm_timeout_secs.max(1)),
        Duration::from_secs(config.generation_timeout_secs.max(1)),
    )
}
