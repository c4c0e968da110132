//! Chat-facing data types shared by the monitor, the messenger and the gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of conversation an inbound event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    #[default]
    Public,
    Private,
    /// 1:1 direct message, never engaged by the monitor.
    Direct,
}

/// An inbound channel event as delivered by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub channel_id: String,
    #[serde(default)]
    pub channel_kind: ChannelKind,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Set when the author is an integration rather than a person.
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub text: String,
    /// Message timestamp/id.
    pub ts: String,
    /// Parent thread id, for replies.
    #[serde(default)]
    pub thread_ts: Option<String>,
}

impl InboundEvent {
    /// A reply inside an existing thread (not the thread's parent message).
    pub fn is_thread_reply(&self) -> bool {
        self.thread_ts
            .as_deref()
            .is_some_and(|parent| parent != self.ts)
    }

    /// Dedup key within the channel: the thread for replies, the message itself otherwise.
    pub fn engagement_key(&self) -> &str {
        if self.is_thread_reply() {
            self.thread_ts.as_deref().unwrap_or(&self.ts)
        } else {
            &self.ts
        }
    }

    pub fn is_authored_by(&self, user_id: &str) -> bool {
        self.user_id.as_deref() == Some(user_id)
    }
}

/// One message fetched from a thread, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub user_id: Option<String>,
    pub text: String,
    pub ts: String,
}

/// Reference to a message the gateway delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub channel_id: String,
    pub ts: String,
}

/// The subset of a user entity the proactive messenger cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub last_contacted_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl Recipient {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: None,
            is_bot: false,
            is_active: true,
            last_contacted_at: None,
        }
    }

    /// Active humans only.
    pub fn is_eligible(&self) -> bool {
        self.is_active && !self.is_bot
    }
}
