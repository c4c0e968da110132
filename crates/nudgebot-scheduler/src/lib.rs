//! # NudgeBot Scheduler
//!
//! Durable job scheduler for recurring and one-shot work.
//!
//! ## Design Principles
//! - SQLite persistence — records and triggers survive restarts
//! - Tokio timers only — one interval tick, zero work when nothing is due
//! - One running instance per job, bounded worker pool overall
//! - Concrete work is injected as handlers; the scheduler knows no messaging
//!
//! ## Architecture
//! ```text
//! TaskScheduler (tokio interval)
//!   ├── trigger table: "random-dm-cycle" every 24h
//!   │                  "img-post"        every 7d
//!   │                  "once-…"          at 2026-03-02T15:00Z
//!   ├── due? → WorkerPool (slot per job + semaphore)
//!   │            └── JobHandler::run → COMPLETED / FAILED
//!   └── SchedulerDb
//!         ├── task_records       (PENDING → EXECUTING → terminal)
//!         └── scheduler_triggers (re-armed by restore_on_startup)
//! ```

pub mod engine;
pub mod handler;
pub mod persistence;
pub mod pool;
pub mod tasks;

pub use engine::{JobInfo, RestoreReport, TaskScheduler};
pub use handler::{FnHandler, HandlerRegistry, JobHandler, handler_fn};
pub use persistence::SchedulerDb;
pub use pool::{PoolStats, WorkerPool};
pub use tasks::{JobSpec, TargetType, TaskRecord, TaskStatus, TaskType};
