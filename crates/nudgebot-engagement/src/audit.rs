//! Audit events — one append-only row per evaluated inbound event.

use chrono::{DateTime, Utc};
use nudgebot_core::error::{NudgeError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    TextResponse,
    Reaction,
    Ignored,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::TextResponse => "text_response",
            AuditEventType::Reaction => "reaction",
            AuditEventType::Ignored => "ignored",
        }
    }
}

impl FromStr for AuditEventType {
    type Err = NudgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text_response" => Ok(AuditEventType::TextResponse),
            "reaction" => Ok(AuditEventType::Reaction),
            "ignored" => Ok(AuditEventType::Ignored),
            other => Err(NudgeError::Validation(format!("unknown audit event type '{other}'"))),
        }
    }
}

/// An engagement decision and its result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Row id, assigned on insert.
    #[serde(default)]
    pub id: Option<i64>,
    pub channel_id: String,
    /// Thread ts for replies, message ts for top-level messages.
    pub thread_key: String,
    pub event_type: AuditEventType,
    pub decision_probability: f64,
    pub random_draw: Option<f64>,
    pub engaged: bool,
    /// Message produced by the engagement, if any.
    pub message_ts: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(channel_id: &str, thread_key: &str, event_type: AuditEventType, now: DateTime<Utc>) -> Self {
        Self {
            id: None,
            channel_id: channel_id.to_string(),
            thread_key: thread_key.to_string(),
            event_type,
            decision_probability: 0.0,
            random_draw: None,
            engaged: false,
            message_ts: None,
            metadata: serde_json::json!({}),
            created_at: now,
        }
    }

    /// Skipped before any draw, e.g. outside active hours.
    pub fn ignored(channel_id: &str, thread_key: &str, reason: &str, now: DateTime<Utc>) -> Self {
        Self::new(channel_id, thread_key, AuditEventType::Ignored, now).with_meta("reason", reason)
    }

    pub fn with_decision(mut self, probability: f64, draw: Option<f64>) -> Self {
        self.decision_probability = probability;
        self.random_draw = draw;
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if let Some(meta) = self.metadata.as_object_mut() {
            meta.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn reason(&self) -> Option<&str> {
        self.metadata.get("reason").and_then(|v| v.as_str())
    }
}
