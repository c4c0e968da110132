//! Recording doubles for the gateway and responder.

use async_trait::async_trait;
use nudgebot_core::error::{NudgeError, Result};
use nudgebot_core::traits::{Gateway, Responder};
use nudgebot_core::types::{ChatMessage, MessageRef};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Sent {
    pub channel_id: String,
    pub text: String,
    pub thread_ts: Option<String>,
}

#[derive(Default)]
pub struct MockGateway {
    send_failures: Mutex<VecDeque<NudgeError>>,
    send_attempts: AtomicUsize,
    sent: Mutex<Vec<Sent>>,
    opened: Mutex<Vec<String>>,
    reactions: Mutex<Vec<(String, String, String)>>,
    threads: Mutex<HashMap<String, Vec<ChatMessage>>>,
    fetch_limits: Mutex<Vec<usize>>,
    fail_fetch: AtomicBool,
    fail_reactions: AtomicBool,
}

impl MockGateway {
    pub fn fail_next_sends(&self, errors: impl IntoIterator<Item = NudgeError>) {
        self.send_failures.lock().unwrap().extend(errors);
    }

    pub fn fail_fetches(&self) {
        self.fail_fetch.store(true, Ordering::SeqCst);
    }

    pub fn fail_reactions(&self) {
        self.fail_reactions.store(true, Ordering::SeqCst);
    }

    /// Seed a thread with `count` replies, oldest first.
    pub fn seed_thread(&self, thread_ts: &str, count: usize) {
        let messages = (0..count)
            .map(|i| ChatMessage {
                user_id: Some(format!("U{i}")),
                text: format!("message {i}"),
                ts: format!("{thread_ts}.{i:03}"),
            })
            .collect();
        self.threads
            .lock()
            .unwrap()
            .insert(thread_ts.to_string(), messages);
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub fn reactions(&self) -> Vec<(String, String, String)> {
        self.reactions.lock().unwrap().clone()
    }

    pub fn fetch_limits(&self) -> Vec<usize> {
        self.fetch_limits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Gateway for MockGateway {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open_direct_channel(&self, user_id: &str) -> Result<String> {
        self.opened.lock().unwrap().push(user_id.to_string());
        Ok(format!("D-{user_id}"))
    }

    async fn send_message(
        &self,
        channel_id: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<MessageRef> {
        let n = self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.send_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.sent.lock().unwrap().push(Sent {
            channel_id: channel_id.to_string(),
            text: text.to_string(),
            thread_ts: thread_ts.map(String::from),
        });
        Ok(MessageRef {
            channel_id: channel_id.to_string(),
            ts: format!("1700000000.{n:06}"),
        })
    }

    async fn add_reaction(&self, channel_id: &str, message_ts: &str, emoji: &str) -> Result<()> {
        if self.fail_reactions.load(Ordering::SeqCst) {
            return Err(NudgeError::transport_fatal("already_reacted"));
        }
        self.reactions.lock().unwrap().push((
            channel_id.to_string(),
            message_ts.to_string(),
            emoji.to_string(),
        ));
        Ok(())
    }

    async fn fetch_thread_replies(
        &self,
        _channel_id: &str,
        thread_ts: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        self.fetch_limits.lock().unwrap().push(limit);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(NudgeError::transport_fatal("thread_not_found"));
        }
        let all = self
            .threads
            .lock()
            .unwrap()
            .get(thread_ts)
            .cloned()
            .unwrap_or_default();
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }
}

#[derive(Default)]
pub struct MockResponder {
    emoji: Mutex<Option<String>>,
    fail_emoji: AtomicBool,
    fail_replies: AtomicBool,
    reply_contexts: Mutex<Vec<Vec<ChatMessage>>>,
    greeting_delay: Mutex<Option<Duration>>,
}

impl MockResponder {
    pub fn answer_emoji(&self, emoji: &str) {
        *self.emoji.lock().unwrap() = Some(emoji.to_string());
    }

    pub fn fail_emoji(&self) {
        self.fail_emoji.store(true, Ordering::SeqCst);
    }

    pub fn delay_greetings(&self, delay: Duration) {
        *self.greeting_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_replies(&self) {
        self.fail_replies.store(true, Ordering::SeqCst);
    }

    pub fn reply_contexts(&self) -> Vec<Vec<ChatMessage>> {
        self.reply_contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Responder for MockResponder {
    fn name(&self) -> &str {
        "mock"
    }

    async fn compose_greeting(&self) -> Result<String> {
        let delay = *self.greeting_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok("hey, how is your week going?".into())
    }

    async fn generate_reply(&self, context: &[ChatMessage], trigger_text: &str) -> Result<String> {
        if self.fail_replies.load(Ordering::SeqCst) {
            return Err(NudgeError::Responder("model overloaded".into()));
        }
        self.reply_contexts.lock().unwrap().push(context.to_vec());
        Ok(format!("re: {trigger_text}"))
    }

    async fn select_emoji(&self, _message_text: &str, allowed: &[String]) -> Result<String> {
        if self.fail_emoji.load(Ordering::SeqCst) {
            return Err(NudgeError::Responder("classifier down".into()));
        }
        Ok(self
            .emoji
            .lock()
            .unwrap()
            .clone()
            .or_else(|| allowed.first().cloned())
            .unwrap_or_else(|| "eyes".into()))
    }

    async fn compose_channel_post(&self) -> Result<String> {
        Ok("this week's drawing prompt: lighthouses".into())
    }
}
