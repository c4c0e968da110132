//! Messaging Gateway trait — delivers messages and reactions over the chat transport.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ChatMessage, MessageRef};

#[async_trait]
pub trait Gateway: Send + Sync {
    fn name(&self) -> &str;

    /// Open (or reuse) a 1:1 channel with a user. Returns the channel id.
    async fn open_direct_channel(&self, user_id: &str) -> Result<String>;

    /// Post `text`; when `thread_ts` is set the message is threaded under it.
    async fn send_message(
        &self,
        channel_id: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<MessageRef>;

    async fn add_reaction(&self, channel_id: &str, message_ts: &str, emoji: &str) -> Result<()>;

    /// Most recent `limit` messages of a thread, oldest first.
    async fn fetch_thread_replies(
        &self,
        channel_id: &str,
        thread_ts: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>>;
}
