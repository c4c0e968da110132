//! SQLite-backed persistence for task records and the durable trigger table.
//! Survives restarts; every multi-row change runs in one transaction.

use chrono::{DateTime, SecondsFormat, Utc};
use nudgebot_core::error::{NudgeError, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::str::FromStr;

use crate::tasks::{JobSpec, TargetType, TaskRecord, TaskStatus, TaskType};

/// Fixed-width RFC 3339 so string comparison in SQL matches time order.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// How a persisted trigger fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Recurring { interval_secs: i64 },
    OneShot,
}

/// A row of the durable trigger table.
#[derive(Debug, Clone)]
pub struct TriggerRow {
    /// `job_name` for recurring triggers, `job_id` for one-shots.
    pub job_key: String,
    pub kind: TriggerKind,
    pub next_fire_at: DateTime<Utc>,
    pub spec: JobSpec,
}

/// What to do with the trigger row when an occurrence closes.
#[derive(Debug, Clone)]
pub enum TriggerWrite<'a> {
    Upsert(&'a TriggerRow),
    Delete(&'a str),
    /// Arm `upsert` and drop `delete` in the same step (one-shot retry).
    Replace { upsert: &'a TriggerRow, delete: &'a str },
    Keep,
}

const RECORD_COLUMNS: &str = "id, job_id, job_name, task_type, target_type, target_id, scheduled_at, \
     executed_at, status, retry_count, error_message, metadata, created_at";

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn parse_col<T: FromStr>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| conversion_err(idx, e.to_string()))
}

fn ts_col(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    parse_ts(raw).ok_or_else(|| conversion_err(idx, format!("bad timestamp '{raw}'")))
}

/// Map a database row to a TaskRecord.
fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<TaskRecord> {
    let task_type: String = row.get(3)?;
    let target_type: String = row.get(4)?;
    let scheduled_at: String = row.get(6)?;
    let executed_at: Option<String> = row.get(7)?;
    let status: String = row.get(8)?;
    let metadata: String = row.get(11)?;
    let created_at: String = row.get(12)?;

    Ok(TaskRecord {
        id: row.get(0)?,
        job_id: row.get(1)?,
        job_name: row.get(2)?,
        task_type: parse_col::<TaskType>(3, &task_type)?,
        target_type: parse_col::<TargetType>(4, &target_type)?,
        target_id: row.get(5)?,
        scheduled_at: ts_col(6, &scheduled_at)?,
        executed_at: executed_at.as_deref().map(|s| ts_col(7, s)).transpose()?,
        status: parse_col::<TaskStatus>(8, &status)?,
        retry_count: row.get(9)?,
        error_message: row.get(10)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({})),
        created_at: ts_col(12, &created_at)?,
    })
}

fn row_to_trigger(row: &rusqlite::Row) -> rusqlite::Result<TriggerRow> {
    let kind: String = row.get(1)?;
    let interval_secs: Option<i64> = row.get(2)?;
    let next_fire_at: String = row.get(3)?;
    let task_type: String = row.get(4)?;
    let target_type: String = row.get(5)?;
    let metadata: String = row.get(7)?;

    let kind = match (kind.as_str(), interval_secs) {
        ("recurring", Some(secs)) => TriggerKind::Recurring {
            interval_secs: secs,
        },
        ("one_shot", _) => TriggerKind::OneShot,
        (other, _) => return Err(conversion_err(1, format!("bad trigger kind '{other}'"))),
    };

    Ok(TriggerRow {
        job_key: row.get(0)?,
        kind,
        next_fire_at: ts_col(3, &next_fire_at)?,
        spec: JobSpec {
            task_type: parse_col::<TaskType>(4, &task_type)?,
            target_type: parse_col::<TargetType>(5, &target_type)?,
            target_id: row.get(6)?,
            metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({})),
        },
    })
}

fn db_err(op: &str) -> impl Fn(rusqlite::Error) -> NudgeError + '_ {
    move |e| NudgeError::Storage(format!("{op}: {e}"))
}

fn insert_record(conn: &Connection, rec: &TaskRecord) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO task_records ({RECORD_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)"),
        params![
            rec.id,
            rec.job_id,
            rec.job_name,
            rec.task_type.as_str(),
            rec.target_type.as_str(),
            rec.target_id,
            fmt_ts(rec.scheduled_at),
            rec.executed_at.map(fmt_ts),
            rec.status.as_str(),
            rec.retry_count,
            rec.error_message,
            rec.metadata.to_string(),
            fmt_ts(rec.created_at),
        ],
    )
    .map_err(db_err("Insert task record"))?;
    Ok(())
}

fn update_record(conn: &Connection, rec: &TaskRecord) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE task_records SET status=?1, executed_at=?2, error_message=?3, metadata=?4, retry_count=?5
             WHERE id=?6",
            params![
                rec.status.as_str(),
                rec.executed_at.map(fmt_ts),
                rec.error_message,
                rec.metadata.to_string(),
                rec.retry_count,
                rec.id,
            ],
        )
        .map_err(db_err("Update task record"))?;
    if changed == 0 {
        return Err(NudgeError::NotFound(format!("task record {}", rec.id)));
    }
    Ok(())
}

fn upsert_trigger(conn: &Connection, trigger: &TriggerRow) -> Result<()> {
    let (kind, interval_secs) = match trigger.kind {
        TriggerKind::Recurring { interval_secs } => ("recurring", Some(interval_secs)),
        TriggerKind::OneShot => ("one_shot", None),
    };
    conn.execute(
        "INSERT INTO scheduler_triggers
            (job_key, kind, interval_secs, next_fire_at, task_type, target_type, target_id, metadata, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
         ON CONFLICT(job_key) DO UPDATE SET
            kind=excluded.kind, interval_secs=excluded.interval_secs,
            next_fire_at=excluded.next_fire_at, task_type=excluded.task_type,
            target_type=excluded.target_type, target_id=excluded.target_id,
            metadata=excluded.metadata, updated_at=excluded.updated_at",
        params![
            trigger.job_key,
            kind,
            interval_secs,
            fmt_ts(trigger.next_fire_at),
            trigger.spec.task_type.as_str(),
            trigger.spec.target_type.as_str(),
            trigger.spec.target_id,
            trigger.spec.metadata.to_string(),
            fmt_ts(Utc::now()),
        ],
    )
    .map_err(db_err("Upsert trigger"))?;
    Ok(())
}

fn delete_trigger(conn: &Connection, job_key: &str) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM scheduler_triggers WHERE job_key = ?1", [job_key])
        .map_err(db_err("Delete trigger"))?;
    Ok(n > 0)
}

fn apply_trigger_write(conn: &Connection, write: &TriggerWrite<'_>) -> Result<()> {
    match write {
        TriggerWrite::Upsert(row) => upsert_trigger(conn, row),
        TriggerWrite::Delete(key) => delete_trigger(conn, key).map(|_| ()),
        TriggerWrite::Replace { upsert, delete } => {
            upsert_trigger(conn, upsert)?;
            delete_trigger(conn, delete).map(|_| ())
        }
        TriggerWrite::Keep => Ok(()),
    }
}

/// SQLite-backed store for task records and triggers.
pub struct SchedulerDb {
    conn: Connection,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db_err("DB pragma"))?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS task_records (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL UNIQUE,
                job_name TEXT,                   -- recurring group, NULL for one-shots
                task_type TEXT NOT NULL,
                target_type TEXT NOT NULL,
                target_id TEXT NOT NULL,
                scheduled_at TEXT NOT NULL,
                executed_at TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );

            -- At most one next occurrence per recurring group.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_task_records_one_pending
                ON task_records(job_name) WHERE status = 'pending' AND job_name IS NOT NULL;

            CREATE INDEX IF NOT EXISTS idx_task_records_status
                ON task_records(status, scheduled_at);

            CREATE TABLE IF NOT EXISTS scheduler_triggers (
                job_key TEXT PRIMARY KEY,
                kind TEXT NOT NULL,              -- 'recurring', 'one_shot'
                interval_secs INTEGER,
                next_fire_at TEXT NOT NULL,
                task_type TEXT NOT NULL,
                target_type TEXT NOT NULL,
                target_id TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL
            );
         ",
            )
            .map_err(db_err("Migration"))?;
        Ok(())
    }

    // ─── Task Records ──────────────────────────────────────

    pub fn insert_record(&self, rec: &TaskRecord) -> Result<()> {
        insert_record(&self.conn, rec)
    }

    pub fn update_record(&self, rec: &TaskRecord) -> Result<()> {
        update_record(&self.conn, rec)
    }

    pub fn get_record(&self, id: &str) -> Result<TaskRecord> {
        self.query_one(&format!("SELECT {RECORD_COLUMNS} FROM task_records WHERE id = ?1"), id)?
            .ok_or_else(|| NudgeError::NotFound(format!("task record {id}")))
    }

    pub fn find_by_job_id(&self, job_id: &str) -> Result<Option<TaskRecord>> {
        self.query_one(
            &format!("SELECT {RECORD_COLUMNS} FROM task_records WHERE job_id = ?1"),
            job_id,
        )
    }

    /// The next occurrence of a recurring group, if armed.
    pub fn pending_for_name(&self, job_name: &str) -> Result<Option<TaskRecord>> {
        self.query_one(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM task_records WHERE job_name = ?1 AND status = 'pending'"
            ),
            job_name,
        )
    }

    /// PENDING record behind a trigger key (job_name or one-shot job_id).
    pub fn pending_for_key(&self, key: &str) -> Result<Option<TaskRecord>> {
        if let Some(rec) = self.pending_for_name(key)? {
            return Ok(Some(rec));
        }
        Ok(self
            .find_by_job_id(key)?
            .filter(|r| r.status == TaskStatus::Pending))
    }

    pub fn pending_one_shots(&self) -> Result<Vec<TaskRecord>> {
        self.query_many(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM task_records
                 WHERE status = 'pending' AND job_name IS NULL ORDER BY scheduled_at"
            ),
            params![],
        )
    }

    /// Occurrences left EXECUTING, i.e. a process died mid-run.
    pub fn executing_records(&self) -> Result<Vec<TaskRecord>> {
        self.query_many(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM task_records
                 WHERE status = 'executing' ORDER BY scheduled_at"
            ),
            params![],
        )
    }

    /// All occurrences of a recurring group, oldest first.
    pub fn records_for_name(&self, job_name: &str) -> Result<Vec<TaskRecord>> {
        self.query_many(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM task_records WHERE job_name = ?1 ORDER BY created_at, scheduled_at"
            ),
            params![job_name],
        )
    }

    pub fn recent_records(&self, limit: usize) -> Result<Vec<TaskRecord>> {
        self.query_many(
            &format!("SELECT {RECORD_COLUMNS} FROM task_records ORDER BY created_at DESC LIMIT ?1"),
            params![limit as i64],
        )
    }

    pub fn count_pending(&self, job_name: &str) -> Result<usize> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM task_records WHERE job_name = ?1 AND status = 'pending'",
                [job_name],
                |r| r.get::<_, i64>(0),
            )
            .map(|n| n as usize)
            .map_err(db_err("Count pending"))
    }

    /// Remove terminal records finished before `cutoff`. Returns rows removed.
    pub fn prune_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM task_records
                 WHERE status IN ('completed', 'failed', 'cancelled')
                   AND COALESCE(executed_at, scheduled_at) < ?1",
                [fmt_ts(cutoff)],
            )
            .map_err(db_err("Prune task records"))
    }

    // ─── Atomic steps ──────────────────────────────────────

    /// Cancel-and-replace: drop any stale PENDING for `job_name`, insert `fresh`
    /// and persist its trigger, in one transaction. Returns stale rows deleted.
    pub fn replace_pending(&self, job_name: &str, fresh: &TaskRecord, trigger: &TriggerRow) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(db_err("Begin replace"))?;
        let deleted = tx
            .execute(
                "DELETE FROM task_records WHERE job_name = ?1 AND status = 'pending'",
                [job_name],
            )
            .map_err(db_err("Delete stale pending"))?;
        insert_record(&tx, fresh)?;
        upsert_trigger(&tx, trigger)?;
        tx.commit().map_err(db_err("Commit replace"))?;
        Ok(deleted)
    }

    /// Arm a one-shot: insert the record and its trigger together.
    pub fn insert_with_trigger(&self, rec: &TaskRecord, trigger: &TriggerRow) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(db_err("Begin insert"))?;
        insert_record(&tx, rec)?;
        upsert_trigger(&tx, trigger)?;
        tx.commit().map_err(db_err("Commit insert"))?;
        Ok(())
    }

    /// Close an occurrence and (optionally) insert its successor as one step.
    pub fn finish_occurrence(
        &self,
        closed: &TaskRecord,
        successor: Option<&TaskRecord>,
        trigger: TriggerWrite<'_>,
    ) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(db_err("Begin finish"))?;
        update_record(&tx, closed)?;
        if let Some(next) = successor {
            insert_record(&tx, next)?;
        }
        apply_trigger_write(&tx, &trigger)?;
        tx.commit().map_err(db_err("Commit finish"))?;
        Ok(())
    }

    /// Delete the trigger and cancel its PENDING record. Returns the cancelled record
    /// and whether a trigger row existed.
    pub fn cancel_job(&self, job_key: &str, reason: &str) -> Result<(Option<TaskRecord>, bool)> {
        let pending = self.pending_for_key(job_key)?;
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(db_err("Begin cancel"))?;
        let had_trigger = delete_trigger(&tx, job_key)?;
        let cancelled = match pending {
            Some(mut rec) => {
                rec.cancel(reason)?;
                update_record(&tx, &rec)?;
                Some(rec)
            }
            None => None,
        };
        tx.commit().map_err(db_err("Commit cancel"))?;
        Ok((cancelled, had_trigger))
    }

    // ─── Triggers ──────────────────────────────────────

    pub fn upsert_trigger(&self, trigger: &TriggerRow) -> Result<()> {
        upsert_trigger(&self.conn, trigger)
    }

    pub fn delete_trigger(&self, job_key: &str) -> Result<bool> {
        delete_trigger(&self.conn, job_key)
    }

    pub fn has_trigger(&self, job_key: &str) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM scheduler_triggers WHERE job_key = ?1",
                [job_key],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
            .map_err(db_err("Query trigger"))
    }

    pub fn load_triggers(&self) -> Result<Vec<TriggerRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT job_key, kind, interval_secs, next_fire_at, task_type, target_type, target_id, metadata
                 FROM scheduler_triggers ORDER BY next_fire_at",
            )
            .map_err(db_err("Prepare"))?;
        let rows = stmt
            .query_map([], row_to_trigger)
            .map_err(db_err("Load triggers"))?;
        let mut out = Vec::new();
        for row in rows {
            match row {
                Ok(t) => out.push(t),
                Err(e) => tracing::warn!("⚠️ Skipping unreadable trigger row: {e}"),
            }
        }
        Ok(out)
    }

    fn query_one(&self, sql: &str, key: &str) -> Result<Option<TaskRecord>> {
        self.conn
            .query_row(sql, [key], row_to_record)
            .optional()
            .map_err(db_err("Query task record"))
    }

    fn query_many(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<TaskRecord>> {
        let mut stmt = self.conn.prepare(sql).map_err(db_err("Prepare"))?;
        let rows = stmt
            .query_map(args, row_to_record)
            .map_err(db_err("Query task records"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read task records"))
    }
}
