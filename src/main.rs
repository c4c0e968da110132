//! # NudgeBot — proactive engagement bot
//!
//! Decides when and whom to engage in a team chat and keeps scheduled work
//! durable across restarts.
//!
//! Usage:
//!   nudgebot run                              # scheduler + monitor, events as JSON lines on stdin
//!   nudgebot jobs list                        # armed jobs and worker pool stats
//!   nudgebot remind --user U1 --at 2026-03-02T15:00:00Z --message "stand-up notes"
//!   nudgebot config set engagement.reaction_probability 0.5
//!   nudgebot audit recent --limit 20

mod console;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use nudgebot_core::config::{ConfigSource, NudgeConfig};
use nudgebot_core::traits::{Gateway, Responder};
use nudgebot_core::types::{InboundEvent, Recipient};
use nudgebot_engagement::jobs::{self, JobDeps};
use nudgebot_engagement::{ChannelMonitor, EngagementDb, LayeredConfig, ProactiveMessenger, RetryGateway};
use nudgebot_scheduler::{SchedulerDb, TaskScheduler, TaskStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use console::{ConsoleGateway, TemplateResponder};

#[derive(Parser)]
#[command(name = "nudgebot", version, about = "🤖 NudgeBot — proactive engagement bot")]
struct Cli {
    /// Path to TOML configuration file (default: ~/.nudgebot/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and feed stdin events (one JSON object per line) to the monitor.
    Run {
        /// Stop when stdin closes instead of waiting for Ctrl+C.
        #[arg(long)]
        exit_on_eof: bool,
    },
    /// Inspect or cancel scheduled jobs.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
    /// Schedule a one-shot reminder DM.
    Remind {
        #[arg(long)]
        user: String,
        /// RFC 3339 time, e.g. 2026-03-02T15:00:00Z
        #[arg(long)]
        at: DateTime<Utc>,
        #[arg(long)]
        message: String,
    },
    /// Send one proactive DM right now, recorded like a scheduled run.
    DmNow,
    /// Manage proactive DM recipients.
    Recipients {
        #[command(subcommand)]
        action: RecipientsAction,
    },
    /// Runtime config overrides (take effect without restart).
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Engagement audit trail.
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    List,
    Info { key: String },
    Cancel { key: String },
    /// Recent task records, newest first.
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
        /// Only records of this recurring job.
        #[arg(long)]
        job: Option<String>,
    },
}

#[derive(Subcommand)]
enum RecipientsAction {
    Add {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        bot: bool,
        #[arg(long)]
        inactive: bool,
    },
    List,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Value is parsed as JSON when possible, otherwise stored as a string.
    Set { key: String, value: String },
    Get { key: String },
    Unset { key: String },
    List,
}

#[derive(Subcommand)]
enum AuditAction {
    Recent {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Every evaluation of one thread or message.
    Thread { channel: String, key: String },
}

/// Everything the subcommands need, wired once.
struct App {
    config: NudgeConfig,
    console: Arc<ConsoleGateway>,
    store: Arc<EngagementDb>,
    scheduler: TaskScheduler,
    deps: JobDeps,
}

impl App {
    fn open(config: NudgeConfig) -> Result<Self> {
        let db_path = config.database.resolved_path();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let store = Arc::new(EngagementDb::open(&db_path)?);
        let settings_source: Arc<dyn ConfigSource> =
            Arc::new(LayeredConfig::new(store.clone(), config.to_source()?));

        let console = Arc::new(ConsoleGateway::new());
        let gateway: Arc<dyn Gateway> = Arc::new(RetryGateway::new(console.clone(), &config.gateway));
        let responder: Arc<dyn Responder> = Arc::new(TemplateResponder);

        let (send_timeout, generation_timeout) = jobs::timeouts(&config.scheduler);
        let messenger = Arc::new(
            ProactiveMessenger::new(gateway.clone(), responder.clone(), store.clone())
                .with_timeouts(send_timeout, generation_timeout),
        );
        let deps = JobDeps {
            gateway,
            responder,
            store: store.clone(),
            messenger,
            config: settings_source,
        };

        let scheduler = TaskScheduler::new(SchedulerDb::open(&db_path)?, config.scheduler.clone());
        jobs::register_handlers(&scheduler, &deps);

        Ok(Self {
            config,
            console,
            store,
            scheduler,
            deps,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "nudgebot=debug,nudgebot_core=debug,nudgebot_scheduler=debug,nudgebot_engagement=debug"
    } else {
        "nudgebot=info,nudgebot_scheduler=info,nudgebot_engagement=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => NudgeConfig::load_from(path)?,
        None => NudgeConfig::load()?,
    };
    let app = App::open(config)?;
    let command = cli.command.unwrap_or(Command::Run { exit_on_eof: false });
    if !matches!(command, Command::Run { .. }) {
        // Admin commands may run beside a daemon: load its triggers, never restore.
        app.scheduler.reload_from_store()?;
    }

    match command {
        Command::Run { exit_on_eof } => run(app, exit_on_eof).await,
        Command::Jobs { action } => jobs_cmd(&app, action),
        Command::Remind { user, at, message } => {
            let rec = jobs::schedule_reminder(&app.scheduler, &user, at, &message, Utc::now())?;
            println!("⏰ Reminder {} for {} at {}", rec.job_id, user, rec.scheduled_at.to_rfc3339());
            Ok(())
        }
        Command::DmNow => {
            let rec = jobs::send_dm_now(&app.scheduler, Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&rec)?);
            match rec.status {
                TaskStatus::Completed => Ok(()),
                _ => anyhow::bail!(
                    "DM {} {}: {}",
                    rec.job_id,
                    rec.status,
                    rec.error_message.as_deref().unwrap_or("no error recorded")
                ),
            }
        }
        Command::Recipients { action } => recipients_cmd(&app, action),
        Command::Config { action } => config_cmd(&app, action),
        Command::Audit { action } => audit_cmd(&app, action),
    }
}

async fn run(app: App, exit_on_eof: bool) -> Result<()> {
    println!("NudgeBot v{}", env!("CARGO_PKG_VERSION"));
    let report = app.scheduler.restore_on_startup()?;
    tracing::debug!("Restore report: {:?}", report);
    let armed = jobs::arm_default_jobs(&app.scheduler, &app.deps, Utc::now())?;
    tracing::info!("📅 Armed jobs: {}", armed.join(", "));
    let ticker = app.scheduler.start();

    let (send_timeout, generation_timeout) = jobs::timeouts(&app.config.scheduler);
    let monitor = Arc::new(
        ChannelMonitor::new(
            app.deps.gateway.clone(),
            app.deps.responder.clone(),
            app.store.clone(),
            app.deps.config.clone(),
            &app.config.bot.user_id,
        )
        .with_timeouts(send_timeout, generation_timeout),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut evaluations = JoinSet::new();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match serde_json::from_str::<InboundEvent>(&line) {
                    Ok(event) => {
                        app.console.observe(&event);
                        let monitor = monitor.clone();
                        evaluations.spawn(async move {
                            let outcome = monitor.handle_event(&event).await;
                            match serde_json::to_string(&outcome) {
                                Ok(json) => println!("{json}"),
                                Err(e) => tracing::warn!("⚠️ Could not print outcome: {e}"),
                            }
                        });
                    }
                    Err(e) => tracing::warn!("⚠️ Skipping malformed event line: {e}"),
                },
                None => {
                    stdin_open = false;
                    if exit_on_eof {
                        break;
                    }
                    tracing::info!("stdin closed; scheduler keeps running, Ctrl+C to stop");
                }
            },
            Some(_) = evaluations.join_next(), if !evaluations.is_empty() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    while evaluations.join_next().await.is_some() {}
    app.scheduler.shutdown().await;
    if let Err(e) = ticker.await {
        tracing::warn!("⚠️ Scheduler loop ended abnormally: {e}");
    }
    Ok(())
}

fn jobs_cmd(app: &App, action: JobsAction) -> Result<()> {
    match action {
        JobsAction::List => {
            for info in app.scheduler.list_jobs()? {
                let next = info
                    .next_fire_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into());
                let every = info
                    .interval_secs
                    .map(|s| format!("every {s}s"))
                    .unwrap_or_else(|| "once".into());
                println!("{:<40} {:<22} {:<16} next {}", info.job_key, info.task_type, every, next);
            }
            let stats = app.scheduler.pool_stats();
            println!(
                "\nworkers: {}/{} active, {} processed",
                stats.active, stats.max_workers, stats.total_processed
            );
        }
        JobsAction::Info { key } => {
            let info = app.scheduler.get_info(&key)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        JobsAction::Cancel { key } => match app.scheduler.cancel(&key)? {
            Some(rec) => println!("🛑 Cancelled {} (pending record {})", key, rec.id),
            None => println!("🛑 Cancelled {}", key),
        },
        JobsAction::History { limit, job } => {
            let records = match job {
                Some(name) => app.scheduler.records_for(&name)?,
                None => app.scheduler.recent_records(limit)?,
            };
            for rec in records.iter().take(limit) {
                println!(
                    "{:<28} {:<10} {} {}",
                    rec.job_name.as_deref().unwrap_or(&rec.job_id),
                    rec.status,
                    rec.scheduled_at.to_rfc3339(),
                    rec.error_message.as_deref().unwrap_or("")
                );
            }
        }
    }
    Ok(())
}

fn recipients_cmd(app: &App, action: RecipientsAction) -> Result<()> {
    match action {
        RecipientsAction::Add {
            id,
            name,
            bot,
            inactive,
        } => {
            let mut recipient = Recipient::new(&id);
            recipient.display_name = name;
            recipient.is_bot = bot;
            recipient.is_active = !inactive;
            app.store.upsert_recipient(&recipient)?;
            println!("✅ Recipient {} saved", id);
        }
        RecipientsAction::List => {
            for r in app.store.list_recipients()? {
                let last = r
                    .last_contacted_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".into());
                let flags = match (r.is_bot, r.is_active) {
                    (true, _) => "bot",
                    (false, false) => "inactive",
                    (false, true) => "",
                };
                println!(
                    "{:<14} {:<20} {:<9} last contacted {}",
                    r.id,
                    r.display_name.as_deref().unwrap_or("-"),
                    flags,
                    last
                );
            }
        }
    }
    Ok(())
}

fn config_cmd(app: &App, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            let parsed = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            app.store.set_config(&key, &parsed)?;
            println!("✅ {} = {}", key, parsed);
        }
        ConfigAction::Get { key } => match app.deps.config.lookup(&key) {
            Some(value) => println!("{value}"),
            None => println!("(unset)"),
        },
        ConfigAction::Unset { key } => {
            if app.store.delete_config(&key)? {
                println!("✅ Override {} removed", key);
            } else {
                println!("No override for {}", key);
            }
        }
        ConfigAction::List => {
            for (key, value) in app.store.list_config()? {
                println!("{key} = {value}");
            }
        }
    }
    Ok(())
}

fn audit_cmd(app: &App, action: AuditAction) -> Result<()> {
    let events = match action {
        AuditAction::Recent { limit } => app.store.recent_events(limit)?,
        AuditAction::Thread { channel, key } => app.store.events_for(&channel, &key)?,
    };
    for event in events {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}
