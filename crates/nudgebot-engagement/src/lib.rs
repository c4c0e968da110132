//! # NudgeBot Engagement
//!
//! Decides whether, how and with whom the bot engages.
//!
//! ## Flow
//! ```text
//! InboundEvent ──▶ ChannelMonitor
//!                    ├── scope / self / DM filter
//!                    ├── dedup (in-flight guard + audit_events)
//!                    ├── decision: active hours, thread activity, draws
//!                    ├── Gateway / Responder (RetryGateway, timeouts)
//!                    └── AuditEvent ──▶ EngagementDb
//!
//! TaskScheduler ──▶ jobs::ProactiveDmJob ──▶ ProactiveMessenger
//!               ├── jobs::ReminderJob
//!               ├── jobs::ChannelPostJob
//!               └── jobs::CleanupJob
//! ```

pub mod audit;
pub mod decision;
pub mod jobs;
pub mod messenger;
pub mod monitor;
pub mod retry;
pub mod settings;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use audit::{AuditEvent, AuditEventType};
pub use decision::{Draws, EngagementType, RandomDraws, ScriptedDraws};
pub use jobs::{JobDeps, arm_default_jobs, register_handlers, schedule_reminder};
pub use messenger::{DeliveryReport, ProactiveMessenger};
pub use monitor::{ChannelMonitor, EventOutcome};
pub use retry::RetryGateway;
pub use settings::LayeredConfig;
pub use store::EngagementDb;
