//! Responder trait — produces message content. Decides *what*, never *whether*.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::ChatMessage;

#[async_trait]
pub trait Responder: Send + Sync {
    fn name(&self) -> &str;

    /// Opening line for an unsolicited direct message.
    async fn compose_greeting(&self) -> Result<String>;

    /// Reply to `trigger_text` given the trailing thread context (oldest first).
    async fn generate_reply(&self, context: &[ChatMessage], trigger_text: &str) -> Result<String>;

    /// Pick an emoji name from `allowed` for the message. Callers fall back to a
    /// default on error or when the answer is outside `allowed`.
    async fn select_emoji(&self, message_text: &str, allowed: &[String]) -> Result<String>;

    /// Content for the recurring channel post (caption plus optional media link).
    async fn compose_channel_post(&self) -> Result<String>;
}
