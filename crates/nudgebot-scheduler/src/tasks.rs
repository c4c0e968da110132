//! Task records — the persisted, audit-visible form of one job occurrence.
//!
//! ```text
//! PENDING ──► EXECUTING ──► COMPLETED
//!    │                 └──► FAILED
//!    ├──► FAILED      (missed: never executed, e.g. lost to a restart)
//!    └──► CANCELLED   (explicit cancel or superseded by a reschedule)
//! ```
//! `executed_at` is set exactly when the status is COMPLETED or FAILED.

use chrono::{DateTime, Utc};
use nudgebot_core::error::{NudgeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Executing => "executing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = NudgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "executing" => Ok(TaskStatus::Executing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(NudgeError::Validation(format!("unknown task status '{other}'"))),
        }
    }
}

/// What kind of work an occurrence represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    RecurringDm,
    RecurringImagePost,
    OneShotReminder,
    Cleanup,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::RecurringDm => "recurring_dm",
            TaskType::RecurringImagePost => "recurring_image_post",
            TaskType::OneShotReminder => "one_shot_reminder",
            TaskType::Cleanup => "cleanup",
        }
    }

    /// Work that composes content before delivering it, so its budget covers
    /// a generation call as well as the send.
    pub fn is_generative(&self) -> bool {
        matches!(self, TaskType::RecurringDm | TaskType::RecurringImagePost)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = NudgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "recurring_dm" => Ok(TaskType::RecurringDm),
            "recurring_image_post" => Ok(TaskType::RecurringImagePost),
            "one_shot_reminder" => Ok(TaskType::OneShotReminder),
            "cleanup" => Ok(TaskType::Cleanup),
            other => Err(NudgeError::Validation(format!("unknown task type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    User,
    Channel,
    System,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::User => "user",
            TargetType::Channel => "channel",
            TargetType::System => "system",
        }
    }
}

impl FromStr for TargetType {
    type Err = NudgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(TargetType::User),
            "channel" => Ok(TargetType::Channel),
            "system" => Ok(TargetType::System),
            other => Err(NudgeError::Validation(format!("unknown target type '{other}'"))),
        }
    }
}

/// The static description of a job: what it does and to whom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub task_type: TaskType,
    pub target_type: TargetType,
    pub target_id: String,
    /// Payload copied into every occurrence's metadata (e.g. reminder text).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl JobSpec {
    pub fn new(task_type: TaskType, target_type: TargetType, target_id: &str) -> Self {
        Self {
            task_type,
            target_type,
            target_id: target_id.to_string(),
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One occurrence of scheduled work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    /// Unique per occurrence.
    pub job_id: String,
    /// Recurring group name; `None` for one-shots.
    pub job_name: Option<String>,
    pub task_type: TaskType,
    pub target_type: TargetType,
    pub target_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Next occurrence of a recurring group.
    pub fn recurring(
        job_name: &str,
        spec: &JobSpec,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::build(Some(job_name.to_string()), spec, scheduled_at, now)
    }

    /// A standalone one-shot occurrence.
    pub fn one_shot(spec: &JobSpec, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self::build(None, spec, scheduled_at, now)
    }

    fn build(
        job_name: Option<String>,
        spec: &JobSpec,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let job_id = match &job_name {
            Some(name) => format!(
                "{name}-{}-{}",
                scheduled_at.timestamp(),
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
            None => format!("once-{}", uuid::Uuid::new_v4().simple()),
        };
        let metadata = if spec.metadata.is_object() {
            spec.metadata.clone()
        } else {
            serde_json::json!({})
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id,
            job_name,
            task_type: spec.task_type,
            target_type: spec.target_type,
            target_id: spec.target_id.clone(),
            scheduled_at,
            executed_at: None,
            status: TaskStatus::Pending,
            retry_count: 0,
            error_message: None,
            metadata,
            created_at: now,
        }
    }

    /// Key the live trigger is registered under.
    pub fn trigger_key(&self) -> &str {
        self.job_name.as_deref().unwrap_or(&self.job_id)
    }

    pub fn is_one_shot(&self) -> bool {
        self.job_name.is_none()
    }

    pub fn spec(&self) -> JobSpec {
        JobSpec {
            task_type: self.task_type,
            target_type: self.target_type,
            target_id: self.target_id.clone(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn start_executing(&mut self) -> Result<()> {
        self.ensure_transition(TaskStatus::Pending, TaskStatus::Executing)?;
        self.status = TaskStatus::Executing;
        Ok(())
    }

    pub fn complete(&mut self, at: DateTime<Utc>, result: serde_json::Value) -> Result<()> {
        self.ensure_transition(TaskStatus::Executing, TaskStatus::Completed)?;
        self.status = TaskStatus::Completed;
        self.executed_at = Some(at);
        self.merge_metadata(result);
        Ok(())
    }

    pub fn fail(&mut self, at: DateTime<Utc>, error: &str, result: serde_json::Value) -> Result<()> {
        self.ensure_transition(TaskStatus::Executing, TaskStatus::Failed)?;
        self.status = TaskStatus::Failed;
        self.executed_at = Some(at);
        self.error_message = Some(error.to_string());
        self.merge_metadata(result);
        Ok(())
    }

    /// A PENDING occurrence that will never run (restart, grace exceeded).
    pub fn mark_missed(&mut self, at: DateTime<Utc>, reason: &str) -> Result<()> {
        self.ensure_transition(TaskStatus::Pending, TaskStatus::Failed)?;
        self.status = TaskStatus::Failed;
        self.executed_at = Some(at);
        self.error_message = Some(reason.to_string());
        Ok(())
    }

    pub fn cancel(&mut self, reason: &str) -> Result<()> {
        self.ensure_transition(TaskStatus::Pending, TaskStatus::Cancelled)?;
        self.status = TaskStatus::Cancelled;
        self.error_message = Some(reason.to_string());
        Ok(())
    }

    fn ensure_transition(&self, from: TaskStatus, to: TaskStatus) -> Result<()> {
        if self.status != from {
            return Err(NudgeError::Validation(format!(
                "task {} cannot move {} → {} (currently {})",
                self.job_id, from, to, self.status
            )));
        }
        Ok(())
    }

    fn merge_metadata(&mut self, result: serde_json::Value) {
        let serde_json::Value::Object(extra) = result else {
            return;
        };
        if !self.metadata.is_object() {
            self.metadata = serde_json::json!({});
        }
        if let Some(meta) = self.metadata.as_object_mut() {
            meta.extend(extra);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).unwrap()
    }

    fn dm_spec() -> JobSpec {
        JobSpec::new(TaskType::RecurringDm, TargetType::User, "random")
    }

    #[test]
    fn test_happy_path_sets_executed_at() {
        let mut rec = TaskRecord::recurring("random-dm-cycle", &dm_spec(), at(10), at(9));
        assert_eq!(rec.status, TaskStatus::Pending);
        assert!(rec.executed_at.is_none());

        rec.start_executing().unwrap();
        assert!(rec.executed_at.is_none());

        rec.complete(at(10), serde_json::json!({"recipient_id": "U1"}))
            .unwrap();
        assert_eq!(rec.status, TaskStatus::Completed);
        assert_eq!(rec.executed_at, Some(at(10)));
        assert_eq!(rec.metadata["recipient_id"], "U1");
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut rec = TaskRecord::one_shot(&dm_spec(), at(10), at(9));
        rec.cancel("superseded").unwrap();
        assert!(rec.status.is_terminal());
        assert!(rec.executed_at.is_none());
        assert!(rec.start_executing().is_err());
        assert!(rec.mark_missed(at(11), "late").is_err());

        let mut rec = TaskRecord::one_shot(&dm_spec(), at(10), at(9));
        rec.start_executing().unwrap();
        rec.fail(at(10), "boom", serde_json::Value::Null).unwrap();
        assert!(rec.complete(at(10), serde_json::json!({})).is_err());
        assert!(rec.cancel("nope").is_err());
    }

    #[test]
    fn test_cannot_complete_without_executing() {
        let mut rec = TaskRecord::one_shot(&dm_spec(), at(10), at(9));
        assert!(rec.complete(at(10), serde_json::json!({})).is_err());
        assert!(rec.fail(at(10), "x", serde_json::json!({})).is_err());
    }

    #[test]
    fn test_missed_is_failed_with_executed_at() {
        let mut rec = TaskRecord::one_shot(&dm_spec(), at(8), at(7));
        rec.mark_missed(at(9), "missed due to restart").unwrap();
        assert_eq!(rec.status, TaskStatus::Failed);
        assert_eq!(rec.executed_at, Some(at(9)));
        assert!(rec.error_message.unwrap().contains("restart"));
    }

    #[test]
    fn test_keys_and_metadata_merge() {
        let spec = dm_spec().with_metadata(serde_json::json!({"origin": "cli"}));
        let mut rec = TaskRecord::recurring("random-dm-cycle", &spec, at(10), at(9));
        assert_eq!(rec.trigger_key(), "random-dm-cycle");
        assert!(!rec.is_one_shot());

        rec.start_executing().unwrap();
        rec.fail(at(10), "err", serde_json::json!({"attempts": 3}))
            .unwrap();
        assert_eq!(rec.metadata["origin"], "cli");
        assert_eq!(rec.metadata["attempts"], 3);

        let once = TaskRecord::one_shot(&dm_spec(), at(10), at(9));
        assert_eq!(once.trigger_key(), once.job_id);
        assert!(once.job_id.starts_with("once-"));
    }

    #[test]
    fn test_enum_round_trip_through_str() {
        for t in [
            TaskType::RecurringDm,
            TaskType::RecurringImagePost,
            TaskType::OneShotReminder,
            TaskType::Cleanup,
        ] {
            assert_eq!(t.as_str().parse::<TaskType>().unwrap(), t);
        }
        assert!("weird".parse::<TaskStatus>().is_err());
    }
}
