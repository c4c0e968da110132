//! NudgeBot configuration system.
//!
//! Two layers:
//! - `NudgeConfig` — process config loaded from TOML (paths, pool sizes, timeouts).
//! - `ConfigSource` — dotted-path lookup (`engagement.active_hours.start`) used to build
//!   a typed `EngagementSettings` snapshot on every evaluation.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{NudgeError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NudgeConfig {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Free-form engagement tunables, read through `ConfigSource`.
    #[serde(default)]
    pub engagement: toml::Table,
}

impl NudgeConfig {
    /// Load config from the default path (~/.nudgebot/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NudgeError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| NudgeError::Config(format!("Failed to parse config: {e}")))
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the NudgeBot home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nudgebot")
    }

    /// Whole config as a TOML tree, for dotted-path lookups.
    pub fn to_source(&self) -> Result<toml::Value> {
        toml::Value::try_from(self)
            .map_err(|e| NudgeError::Config(format!("Failed to serialize config: {e}")))
    }
}

/// Identity of the automated participant.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BotConfig {
    /// Own user id. Events authored by it are ignored.
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.nudgebot/nudgebot.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl DatabaseConfig {
    /// Path with `~` expanded. `:memory:` is passed through.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

/// Scheduler execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Worker pool size shared by all jobs.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// A firing later than this is skipped instead of run late.
    #[serde(default = "default_misfire_grace_secs")]
    pub misfire_grace_secs: u64,
    /// Budget for direct-message delivery jobs.
    #[serde(default = "default_dm_timeout_secs")]
    pub dm_timeout_secs: u64,
    /// Budget for generative / image-producing jobs.
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    #[serde(default)]
    pub one_shot_max_retries: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

fn default_tick_ms() -> u64 { 1000 }
fn default_max_workers() -> usize { 4 }
fn default_misfire_grace_secs() -> u64 { 3600 }
fn default_dm_timeout_secs() -> u64 { 30 }
fn default_generation_timeout_secs() -> u64 { 300 }
fn default_retry_backoff_secs() -> u64 { 300 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            max_workers: default_max_workers(),
            misfire_grace_secs: default_misfire_grace_secs(),
            dm_timeout_secs: default_dm_timeout_secs(),
            generation_timeout_secs: default_generation_timeout_secs(),
            one_shot_max_retries: 0,
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

/// Transport retry policy applied at the gateway boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_retry_max_attempts() -> usize { 3 }
fn default_retry_base_delay_ms() -> u64 { 500 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

// ─── Dotted-path lookup ──────────────────────────────────────

/// Read-only key/value configuration addressed by dotted paths.
pub trait ConfigSource: Send + Sync {
    fn lookup(&self, path: &str) -> Option<serde_json::Value>;

    fn get_f64(&self, path: &str, default: f64) -> f64 {
        self.lookup(path)
            .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
            .unwrap_or(default)
    }

    fn get_u64(&self, path: &str, default: u64) -> u64 {
        self.get_opt_u64(path).unwrap_or(default)
    }

    fn get_opt_u64(&self, path: &str) -> Option<u64> {
        self.lookup(path).and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        })
    }

    fn get_bool(&self, path: &str, default: bool) -> bool {
        self.lookup(path).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    fn get_string(&self, path: &str) -> Option<String> {
        self.lookup(path)
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.trim().is_empty())
    }

    fn get_string_list(&self, path: &str) -> Option<Vec<String>> {
        let value = self.lookup(path)?;
        match value {
            serde_json::Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            // "C1, C2" in a key/value override
            serde_json::Value::String(s) => Some(
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect(),
            ),
            _ => None,
        }
    }
}

impl ConfigSource for toml::Value {
    fn lookup(&self, path: &str) -> Option<serde_json::Value> {
        let mut node = self;
        for part in path.split('.') {
            node = node.as_table()?.get(part)?;
        }
        serde_json::to_value(node).ok()
    }
}

impl ConfigSource for HashMap<String, serde_json::Value> {
    fn lookup(&self, path: &str) -> Option<serde_json::Value> {
        self.get(path).cloned()
    }
}

// ─── Typed engagement snapshot ──────────────────────────────

pub const DEFAULT_ALLOWED_EMOJIS: &[&str] = &[
    "thumbsup", "eyes", "raised_hands", "tada", "fire", "100", "heart", "joy", "thinking_face",
];

/// Engagement tunables, resolved once per evaluation.
#[derive(Debug, Clone)]
pub struct EngagementSettings {
    pub thread_response_probability: f64,
    /// Top-level message: chance of adding a reaction.
    pub reaction_probability: f64,
    /// Top-level message: chance of posting a threaded text reply.
    pub top_level_response_probability: f64,
    /// Thread reply: share of "text" in the text/reaction split.
    pub text_engagement_weight: f64,
    pub thread_activity_threshold: u64,
    pub context_window: usize,
    pub active_hours_start: Option<u32>,
    pub active_hours_end: Option<u32>,
    pub timezone: Tz,
    /// Empty means every channel is monitored.
    pub monitored_channels: Vec<String>,
    pub allowed_emojis: Vec<String>,
    pub default_emoji: String,
    pub random_dm_enabled: bool,
    pub random_dm_interval_hours: u64,
    pub image_post_channel: Option<String>,
    pub image_post_interval_days: u64,
    pub retention_days: u64,
}

/// An hour bound in `0..=23`; anything else is dropped as unset.
fn hour_of_day(source: &dyn ConfigSource, key: &str) -> Option<u32> {
    let hour = source.get_opt_u64(key)?;
    match u32::try_from(hour) {
        Ok(h) if h <= 23 => Some(h),
        _ => {
            tracing::warn!("⚠️ Ignoring {key} = {hour}: hours run 0-23");
            None
        }
    }
}

impl EngagementSettings {
    pub fn load(source: &dyn ConfigSource) -> Self {
        let timezone = match source.get_string("engagement.active_hours.timezone") {
            Some(name) => name.parse::<Tz>().unwrap_or_else(|_| {
                tracing::warn!("⚠️ Unknown timezone '{name}', using UTC");
                Tz::UTC
            }),
            None => Tz::UTC,
        };

        Self {
            thread_response_probability: source
                .get_f64("engagement.thread_response_probability", 0.3),
            reaction_probability: source.get_f64("engagement.reaction_probability", 0.2),
            top_level_response_probability: source
                .get_f64("engagement.top_level_response_probability", 0.1),
            text_engagement_weight: source.get_f64("engagement.text_engagement_weight", 0.7),
            thread_activity_threshold: source.get_u64("engagement.thread_activity_threshold", 10),
            context_window: source.get_u64("engagement.context_window", 5) as usize,
            active_hours_start: hour_of_day(source, "engagement.active_hours.start"),
            active_hours_end: hour_of_day(source, "engagement.active_hours.end"),
            timezone,
            monitored_channels: source
                .get_string_list("engagement.monitored_channels")
                .unwrap_or_default(),
            allowed_emojis: source
                .get_string_list("engagement.allowed_emojis")
                .filter(|list| !list.is_empty())
                .unwrap_or_else(|| DEFAULT_ALLOWED_EMOJIS.iter().map(|s| s.to_string()).collect()),
            default_emoji: source
                .get_string("engagement.default_emoji")
                .unwrap_or_else(|| "thumbsup".into()),
            random_dm_enabled: source.get_bool("engagement.random_dm_enabled", true),
            random_dm_interval_hours: source.get_u64("engagement.random_dm_interval_hours", 24),
            image_post_channel: source.get_string("engagement.image_post_channel"),
            image_post_interval_days: source.get_u64("engagement.image_post_interval_days", 7),
            retention_days: source.get_u64("engagement.retention_days", 90),
        }
    }

    /// Whether events from `channel_id` are in scope.
    pub fn monitors(&self, channel_id: &str) -> bool {
        self.monitored_channels.is_empty() || self.monitored_channels.iter().any(|c| c == channel_id)
    }
}
