//! Dry-run collaborators for `nudgebot run`.
//!
//! `ConsoleGateway` prints deliveries instead of calling a chat API and remembers
//! the thread messages it has seen, so thread-context fetches work offline.
//! `TemplateResponder` writes content from fixed templates.

use async_trait::async_trait;
use chrono::Utc;
use nudgebot_core::error::{NudgeError, Result};
use nudgebot_core::traits::{Gateway, Responder};
use nudgebot_core::types::{ChatMessage, InboundEvent, MessageRef};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

type ThreadKey = (String, String);

#[derive(Default)]
pub struct ConsoleGateway {
    seq: AtomicU64,
    threads: Mutex<HashMap<ThreadKey, Vec<ChatMessage>>>,
}

impl ConsoleGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_ts(&self) -> String {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        format!("{}.{:06}", Utc::now().timestamp(), n % 1_000_000)
    }

    fn remember(&self, channel_id: &str, root_ts: &str, message: ChatMessage) -> Result<()> {
        self.threads
            .lock()
            .map_err(|_| NudgeError::Internal("console thread log is poisoned".into()))?
            .entry((channel_id.to_string(), root_ts.to_string()))
            .or_default()
            .push(message);
        Ok(())
    }

    /// Record an inbound message so later thread fetches include it.
    pub fn observe(&self, event: &InboundEvent) {
        let root = event.thread_ts.as_deref().unwrap_or(&event.ts);
        let message = ChatMessage {
            user_id: event.user_id.clone(),
            text: event.text.clone(),
            ts: event.ts.clone(),
        };
        if let Err(e) = self.remember(&event.channel_id, root, message) {
            tracing::warn!("⚠️ Could not record event {}: {e}", event.ts);
        }
    }
}

#[async_trait]
impl Gateway for ConsoleGateway {
    fn name(&self) -> &str {
        "console"
    }

    async fn open_direct_channel(&self, user_id: &str) -> Result<String> {
        if user_id.trim().is_empty() {
            return Err(NudgeError::transport_fatal("user_not_found"));
        }
        Ok(format!("D-{user_id}"))
    }

    async fn send_message(
        &self,
        channel_id: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<MessageRef> {
        let ts = self.next_ts();
        match thread_ts {
            Some(root) => {
                println!("📤 [{channel_id} ⤷ {root}] {text}");
                self.remember(
                    channel_id,
                    root,
                    ChatMessage {
                        user_id: None,
                        text: text.to_string(),
                        ts: ts.clone(),
                    },
                )?;
            }
            None => println!("📤 [{channel_id}] {text}"),
        }
        tracing::debug!("Console delivered {} to {}", ts, channel_id);
        Ok(MessageRef {
            channel_id: channel_id.to_string(),
            ts,
        })
    }

    async fn add_reaction(&self, channel_id: &str, message_ts: &str, emoji: &str) -> Result<()> {
        println!("👍 [{channel_id} @ {message_ts}] :{emoji}:");
        Ok(())
    }

    async fn fetch_thread_replies(
        &self,
        channel_id: &str,
        thread_ts: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let threads = self
            .threads
            .lock()
            .map_err(|_| NudgeError::Internal("console thread log is poisoned".into()))?;
        let all = threads
            .get(&(channel_id.to_string(), thread_ts.to_string()))
            .map(Vec::as_slice)
            .unwrap_or_default();
        let skip = all.len().saturating_sub(limit);
        Ok(all[skip..].to_vec())
    }
}

const GREETINGS: &[&str] = &[
    "Hey! How is your week going?",
    "Hi there, anything fun on your plate today?",
    "Quick check-in: what are you working on right now?",
    "Hello! Seen anything interesting lately?",
];

const CHANNEL_POSTS: &[&str] = &[
    "🎨 Drawing prompt of the week: a lighthouse in a storm.",
    "🎨 Drawing prompt of the week: your desk, from above.",
    "🎨 Drawing prompt of the week: a city made of books.",
];

/// Keyword rules for reactions, first match wins.
const EMOJI_RULES: &[(&[&str], &str)] = &[
    (&["thank", "thx"], "raised_hands"),
    (&["shipped", "launched", "released", "done"], "tada"),
    (&["?"], "thinking_face"),
    (&["lol", "haha"], "joy"),
    (&["love", "great"], "heart"),
];

#[derive(Debug, Default)]
pub struct TemplateResponder;

fn pick(options: &[&str]) -> String {
    options
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl Responder for TemplateResponder {
    fn name(&self) -> &str {
        "template"
    }

    async fn compose_greeting(&self) -> Result<String> {
        Ok(pick(GREETINGS))
    }

    async fn generate_reply(&self, context: &[ChatMessage], trigger_text: &str) -> Result<String> {
        let topic: String = trigger_text.chars().take(60).collect();
        Ok(format!(
            "Following along ({} messages so far). On \"{}\": tell me more!",
            context.len(),
            topic.trim()
        ))
    }

    async fn select_emoji(&self, message_text: &str, allowed: &[String]) -> Result<String> {
        let lower = message_text.to_lowercase();
        let matched = EMOJI_RULES
            .iter()
            .filter(|(words, _)| words.iter().any(|w| lower.contains(w)))
            .map(|(_, emoji)| *emoji)
            .find(|emoji| allowed.iter().any(|a| a == emoji));
        matched
            .map(str::to_string)
            .or_else(|| allowed.first().cloned())
            .ok_or_else(|| NudgeError::Responder("no allowed emojis".into()))
    }

    async fn compose_channel_post(&self) -> Result<String> {
        Ok(pick(CHANNEL_POSTS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nudgebot_core::types::ChannelKind;

    fn event(ts: &str, thread_ts: Option<&str>, text: &str) -> InboundEvent {
        InboundEvent {
            channel_id: "C1".into(),
            channel_kind: ChannelKind::Public,
            user_id: Some("U1".into()),
            bot_id: None,
            text: text.into(),
            ts: ts.into(),
            thread_ts: thread_ts.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_thread_fetch_sees_observed_and_sent_messages() {
        let gw = ConsoleGateway::new();
        gw.observe(&event("100.1", None, "parent"));
        gw.observe(&event("100.2", Some("100.1"), "first reply"));
        gw.send_message("C1", "bot reply", Some("100.1")).await.unwrap();

        let all = gw.fetch_thread_replies("C1", "100.1", 10).await.unwrap();
        let texts: Vec<_> = all.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["parent", "first reply", "bot reply"]);

        let last = gw.fetch_thread_replies("C1", "100.1", 1).await.unwrap();
        assert_eq!(last[0].text, "bot reply");
        assert!(gw.fetch_thread_replies("C2", "100.1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_emoji_stays_within_allowed_list() {
        let responder = TemplateResponder;
        let allowed = vec!["eyes".to_string(), "tada".to_string()];
        assert_eq!(responder.select_emoji("we shipped it", &allowed).await.unwrap(), "tada");
        // "thinking_face" is not allowed here
        assert_eq!(responder.select_emoji("why?", &allowed).await.unwrap(), "eyes");
        assert!(responder.select_emoji("hi", &[]).await.is_err());
    }
}
