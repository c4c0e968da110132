//! Engagement database — audit events, recipients and runtime config overrides.
//!
//! At most one engaged audit row per (channel, thread key) is enforced by a partial
//! UNIQUE index, so two racing evaluations cannot both commit an engagement.

use chrono::{DateTime, Utc};
use nudgebot_core::error::{NudgeError, Result};
use nudgebot_core::types::Recipient;
use nudgebot_scheduler::persistence::{fmt_ts, parse_ts};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::audit::{AuditEvent, AuditEventType};

const AUDIT_SELECT: &str = "SELECT id, channel_id, thread_key, event_type, decision_probability, random_draw, \
     engaged, message_ts, metadata, created_at FROM audit_events";

const RECIPIENT_SELECT: &str =
    "SELECT id, display_name, is_bot, is_active, last_contacted_at FROM recipients";

fn db_err(op: &str) -> impl Fn(rusqlite::Error) -> NudgeError + '_ {
    move |e| NudgeError::Storage(format!("{op}: {e}"))
}

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<AuditEvent> {
    let event_type: String = row.get(3)?;
    let metadata: String = row.get(8)?;
    let created_at: String = row.get(9)?;
    Ok(AuditEvent {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        thread_key: row.get(2)?,
        event_type: event_type
            .parse::<AuditEventType>()
            .map_err(|e| conversion_err(3, e.to_string()))?,
        decision_probability: row.get(4)?,
        random_draw: row.get(5)?,
        engaged: row.get(6)?,
        message_ts: row.get(7)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({})),
        created_at: parse_ts(&created_at)
            .ok_or_else(|| conversion_err(9, format!("bad timestamp '{created_at}'")))?,
    })
}

fn row_to_recipient(row: &rusqlite::Row) -> rusqlite::Result<Recipient> {
    let last: Option<String> = row.get(4)?;
    Ok(Recipient {
        id: row.get(0)?,
        display_name: row.get(1)?,
        is_bot: row.get(2)?,
        is_active: row.get(3)?,
        last_contacted_at: last.as_deref().and_then(parse_ts),
    })
}

/// SQLite store shared by the monitor, the messenger and the admin CLI.
pub struct EngagementDb {
    conn: Mutex<Connection>,
}

impl EngagementDb {
    /// Open or create the engagement database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db_err("DB pragma"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| NudgeError::Internal("engagement db mutex is poisoned".into()))
    }

    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id TEXT NOT NULL,
                thread_key TEXT NOT NULL,
                event_type TEXT NOT NULL,        -- text_response, reaction, ignored
                decision_probability REAL NOT NULL DEFAULT 0,
                random_draw REAL,
                engaged INTEGER NOT NULL DEFAULT 0,
                message_ts TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_audit_one_engagement
                ON audit_events(channel_id, thread_key) WHERE engaged = 1;

            CREATE INDEX IF NOT EXISTS idx_audit_created
                ON audit_events(created_at);

            CREATE TABLE IF NOT EXISTS recipients (
                id TEXT PRIMARY KEY,
                display_name TEXT,
                is_bot INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_contacted_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS app_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,             -- JSON
                updated_at TEXT NOT NULL
            );
         ",
            )
            .map_err(db_err("Migration"))?;
        Ok(())
    }

    // ─── Audit ──────────────────────────────────────

    /// Whether an engaged audit event exists for this key.
    pub fn has_engaged(&self, channel_id: &str, thread_key: &str) -> Result<bool> {
        let conn = self.conn()?;
        has_engaged(&conn, channel_id, thread_key)
    }

    /// Append an audit event in its own transaction. An engaged event for a key that
    /// already has one fails with `DuplicateEngagement` and nothing is written.
    pub fn record_event(&self, event: &AuditEvent) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err("Begin audit"))?;
        let key = format!("{}/{}", event.channel_id, event.thread_key);
        if event.engaged && has_engaged(&tx, &event.channel_id, &event.thread_key)? {
            return Err(NudgeError::DuplicateEngagement(key));
        }
        let inserted = tx.execute(
            "INSERT INTO audit_events
                (channel_id, thread_key, event_type, decision_probability, random_draw, engaged,
                 message_ts, metadata, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                event.channel_id,
                event.thread_key,
                event.event_type.as_str(),
                event.decision_probability,
                event.random_draw,
                event.engaged,
                event.message_ts,
                event.metadata.to_string(),
                fmt_ts(event.created_at),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(NudgeError::DuplicateEngagement(key));
            }
            Err(e) => return Err(db_err("Insert audit event")(e)),
        }
        let id = tx.last_insert_rowid();
        tx.commit().map_err(db_err("Commit audit"))?;
        Ok(id)
    }

    /// Latest audit events, newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{AUDIT_SELECT} ORDER BY id DESC LIMIT ?1"))
            .map_err(db_err("Prepare"))?;
        let rows = stmt
            .query_map([limit as i64], row_to_event)
            .map_err(db_err("Query audit events"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read audit events"))
    }

    pub fn events_for(&self, channel_id: &str, thread_key: &str) -> Result<Vec<AuditEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "{AUDIT_SELECT} WHERE channel_id = ?1 AND thread_key = ?2 ORDER BY id"
            ))
            .map_err(db_err("Prepare"))?;
        let rows = stmt
            .query_map([channel_id, thread_key], row_to_event)
            .map_err(db_err("Query audit events"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read audit events"))
    }

    /// Drop non-engaged rows older than `cutoff`. Engaged rows back the dedup guard
    /// and are kept.
    pub fn prune_events_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.conn()?
            .execute(
                "DELETE FROM audit_events WHERE created_at < ?1 AND engaged = 0",
                [fmt_ts(cutoff)],
            )
            .map_err(db_err("Prune audit events"))
    }

    // ─── Recipients ──────────────────────────────────────

    /// Insert or update a recipient. A `None` `last_contacted_at` keeps the stored value.
    pub fn upsert_recipient(&self, recipient: &Recipient) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO recipients (id, display_name, is_bot, is_active, last_contacted_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6)
                 ON CONFLICT(id) DO UPDATE SET
                    display_name = COALESCE(excluded.display_name, recipients.display_name),
                    is_bot = excluded.is_bot,
                    is_active = excluded.is_active,
                    last_contacted_at = COALESCE(excluded.last_contacted_at, recipients.last_contacted_at),
                    updated_at = excluded.updated_at",
                params![
                    recipient.id,
                    recipient.display_name,
                    recipient.is_bot,
                    recipient.is_active,
                    recipient.last_contacted_at.map(fmt_ts),
                    fmt_ts(Utc::now()),
                ],
            )
            .map_err(db_err("Upsert recipient"))?;
        Ok(())
    }

    pub fn get_recipient(&self, id: &str) -> Result<Recipient> {
        self.conn()?
            .query_row(&format!("{RECIPIENT_SELECT} WHERE id = ?1"), [id], row_to_recipient)
            .optional()
            .map_err(db_err("Get recipient"))?
            .ok_or_else(|| NudgeError::NotFound(format!("recipient {id}")))
    }

    pub fn list_recipients(&self) -> Result<Vec<Recipient>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{RECIPIENT_SELECT} ORDER BY id"))
            .map_err(db_err("Prepare"))?;
        let rows = stmt
            .query_map([], row_to_recipient)
            .map_err(db_err("Query recipients"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read recipients"))
    }

    /// Stamp a confirmed delivery.
    pub fn mark_contacted(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE recipients SET last_contacted_at = ?1, updated_at = ?1 WHERE id = ?2",
                params![fmt_ts(at), id],
            )
            .map_err(db_err("Mark contacted"))?;
        if changed == 0 {
            return Err(NudgeError::NotFound(format!("recipient {id}")));
        }
        Ok(())
    }

    // ─── Config overrides ──────────────────────────────────────

    pub fn set_config(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO app_config (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value.to_string(), fmt_ts(Utc::now())],
            )
            .map_err(db_err("Set config"))?;
        Ok(())
    }

    pub fn get_config(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let raw: Option<String> = self
            .conn()?
            .query_row("SELECT value FROM app_config WHERE key = ?1", [key], |r| r.get(0))
            .optional()
            .map_err(db_err("Get config"))?;
        Ok(raw.map(|s| serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s))))
    }

    pub fn list_config(&self) -> Result<Vec<(String, serde_json::Value)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT key, value FROM app_config ORDER BY key")
            .map_err(db_err("Prepare"))?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .map_err(db_err("Query config"))?;
        let mut out = Vec::new();
        for row in rows {
            let (key, raw) = row.map_err(db_err("Read config"))?;
            let value = serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
            out.push((key, value));
        }
        Ok(out)
    }

    pub fn delete_config(&self, key: &str) -> Result<bool> {
        let n = self
            .conn()?
            .execute("DELETE FROM app_config WHERE key = ?1", [key])
            .map_err(db_err("Delete config"))?;
        Ok(n > 0)
    }
}

fn has_engaged(conn: &Connection, channel_id: &str, thread_key: &str) -> Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM audit_events WHERE channel_id = ?1 AND thread_key = ?2 AND engaged = 1)",
        [channel_id, thread_key],
        |r| r.get::<_, bool>(0),
    )
    .map_err(db_err("Dedup check"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::path::PathBuf;

    fn temp_db() -> EngagementDb {
        EngagementDb::open(&PathBuf::from(":memory:")).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn engaged(channel: &str, key: &str) -> AuditEvent {
        let mut ev = AuditEvent::new(channel, key, AuditEventType::TextResponse, now())
            .with_decision(0.3, Some(0.1));
        ev.engaged = true;
        ev.message_ts = Some("9.9".into());
        ev
    }

    #[test]
    fn test_audit_round_trip_and_dedup() {
        let db = temp_db();
        assert!(!db.has_engaged("C1", "TS1").unwrap());

        let ignored = AuditEvent::ignored("C1", "TS1", "probability", now()).with_decision(0.3, Some(0.8));
        db.record_event(&ignored).unwrap();
        assert!(!db.has_engaged("C1", "TS1").unwrap());

        db.record_event(&engaged("C1", "TS1")).unwrap();
        assert!(db.has_engaged("C1", "TS1").unwrap());
        assert!(!db.has_engaged("C2", "TS1").unwrap());

        let events = db.events_for("C1", "TS1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].reason(), Some("probability"));
        assert_eq!(events[0].random_draw, Some(0.8));
        assert_eq!(events[1].message_ts.as_deref(), Some("9.9"));
    }

    #[test]
    fn test_second_engagement_for_key_rejected() {
        let db = temp_db();
        db.record_event(&engaged("C1", "TS1")).unwrap();
        let err = db.record_event(&engaged("C1", "TS1")).unwrap_err();
        assert!(matches!(err, NudgeError::DuplicateEngagement(_)));
        // Ignored rows for the same key are still appended.
        db.record_event(&AuditEvent::ignored("C1", "TS1", "already_handled", now()))
            .unwrap();
        assert_eq!(db.events_for("C1", "TS1").unwrap().len(), 2);
    }

    #[test]
    fn test_unique_index_blocks_raw_duplicate() {
        let db = temp_db();
        db.record_event(&engaged("C1", "TS1")).unwrap();
        let conn = db.conn().unwrap();
        let err = conn
            .execute(
                "INSERT INTO audit_events (channel_id, thread_key, event_type, engaged, created_at)
                 VALUES ('C1', 'TS1', 'reaction', 1, '2026-03-02T10:00:00.000Z')",
                [],
            )
            .unwrap_err();
        assert!(is_constraint_violation(&err));
    }

    #[test]
    fn test_prune_events() {
        let db = temp_db();
        let mut old = AuditEvent::ignored("C1", "1.0", "probability", now() - Duration::days(100));
        db.record_event(&old).unwrap();
        old.created_at = now();
        old.thread_key = "2.0".into();
        db.record_event(&old).unwrap();
        let mut engaged_long_ago = engaged("C1", "3.0");
        engaged_long_ago.created_at = now() - Duration::days(100);
        db.record_event(&engaged_long_ago).unwrap();

        assert_eq!(db.prune_events_before(now() - Duration::days(90)).unwrap(), 1);
        assert_eq!(db.recent_events(10).unwrap().len(), 2);
        assert!(db.has_engaged("C1", "3.0").unwrap());
    }

    #[test]
    fn test_recipient_upsert_keeps_contact_time() {
        let db = temp_db();
        db.upsert_recipient(&Recipient::new("U1")).unwrap();
        db.mark_contacted("U1", now()).unwrap();

        let mut refreshed = Recipient::new("U1");
        refreshed.display_name = Some("Ana".into());
        db.upsert_recipient(&refreshed).unwrap();

        let stored = db.get_recipient("U1").unwrap();
        assert_eq!(stored.last_contacted_at, Some(now()));
        assert_eq!(stored.display_name.as_deref(), Some("Ana"));
        assert!(matches!(db.mark_contacted("U404", now()), Err(NudgeError::NotFound(_))));
        assert_eq!(db.list_recipients().unwrap().len(), 1);
    }

    #[test]
    fn test_config_overrides() {
        let db = temp_db();
        assert!(db.get_config("engagement.reaction_probability").unwrap().is_none());
        db.set_config("engagement.reaction_probability", &serde_json::json!(0.9))
            .unwrap();
        db.set_config("engagement.reaction_probability", &serde_json::json!(0.5))
            .unwrap();
        assert_eq!(
            db.get_config("engagement.reaction_probability").unwrap(),
            Some(serde_json::json!(0.5))
        );
        assert_eq!(db.list_config().unwrap().len(), 1);
        assert!(db.delete_config("engagement.reaction_probability").unwrap());
        assert!(!db.delete_config("engagement.reaction_probability").unwrap());
    }
}
