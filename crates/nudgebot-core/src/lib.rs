//! # NudgeBot Core
//!
//! Shared building blocks for the proactive engagement core:
//! - `error` — one error taxonomy used by every crate
//! - `config` — TOML process config + dotted-path engagement settings
//! - `types` — chat events, message refs, recipients
//! - `traits` — the Messaging Gateway and Responder collaborators

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{ConfigSource, EngagementSettings, NudgeConfig};
pub use error::{NudgeError, Result};
