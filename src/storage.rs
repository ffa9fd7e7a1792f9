//! Embedded relational store: users, sessions, transcripts, summaries,
//! and the audit event table.
//!
//! One `Connection` behind a mutex per process; every writer goes through
//! prepared statements, multi-statement work runs inside a transaction.
//! Schema changes are tracked in a `migrations` version table.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ── Row types ───────────────────────────────────────────────────────

/// Speaker role on a transcript row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "assistant" => Self::Assistant,
            "system" => Self::System,
            _ => Self::User,
        }
    }
}

/// A user row, keyed by browser fingerprint.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub fingerprint: String,
    pub first_seen_at: String,
    pub last_seen_at: String,
    /// Sessions that existed before the current one.
    pub previous_session_count: i64,
}

/// One transcript entry; non-final rows are collapsed by later updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub session_id: String,
    pub user_id: Option<String>,
    pub role: Role,
    pub content: String,
    pub confidence: f64,
    pub timestamp_ms: u64,
    pub is_final: bool,
}

/// A persisted audit event row.
#[derive(Debug, Clone)]
pub struct AuditEventRow {
    pub event_id: String,
    pub session_id: String,
    pub event_type: String,
    pub source: String,
    pub timestamp_ms: u64,
    pub payload: String,
}

/// Cross-session conversation summary.
#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub user_id: String,
    pub from_session_id: String,
    pub to_session_id: Option<String>,
    pub summary: String,
    pub turn_count: u32,
}

// ── Store ───────────────────────────────────────────────────────────

const SCHEMA_VERSION: u32 = 1;

pub struct SqlStore {
    conn: Mutex<Connection>,
}

impl SqlStore {
    /// Open (or create) the database and bring the schema current.
    pub fn open(db_path: &Path, wal_mode: bool) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database dir: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        if wal_mode {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous  = NORMAL;",
            )?;
        }
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Self::migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS migrations (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;

        let current: u32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM migrations", [], |r| {
                r.get(0)
            })
            .unwrap_or(0);

        if current < 1 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    id            TEXT PRIMARY KEY,
                    fingerprint   TEXT NOT NULL UNIQUE,
                    first_seen_at TEXT NOT NULL,
                    last_seen_at  TEXT NOT NULL,
                    metadata      TEXT NOT NULL DEFAULT '{}'
                );
                CREATE TABLE IF NOT EXISTS sessions (
                    id         TEXT PRIMARY KEY,
                    user_id    TEXT REFERENCES users(id),
                    started_at TEXT NOT NULL,
                    ended_at   TEXT,
                    end_reason TEXT,
                    metadata   TEXT NOT NULL DEFAULT '{}'
                );
                CREATE TABLE IF NOT EXISTS transcripts (
                    id           INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id   TEXT NOT NULL REFERENCES sessions(id),
                    user_id      TEXT REFERENCES users(id),
                    role         TEXT NOT NULL CHECK (role IN ('user','assistant','system')),
                    content      TEXT NOT NULL,
                    confidence   REAL NOT NULL DEFAULT 1.0,
                    timestamp_ms INTEGER NOT NULL,
                    is_final     INTEGER NOT NULL DEFAULT 0 CHECK (is_final IN (0,1))
                );
                CREATE TABLE IF NOT EXISTS conversation_summaries (
                    id              INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id         TEXT NOT NULL REFERENCES users(id),
                    from_session_id TEXT NOT NULL REFERENCES sessions(id),
                    to_session_id   TEXT REFERENCES sessions(id),
                    summary         TEXT NOT NULL,
                    turn_count      INTEGER NOT NULL DEFAULT 0,
                    created_at      TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS audit_events (
                    event_id     TEXT NOT NULL UNIQUE,
                    session_id   TEXT NOT NULL REFERENCES sessions(id),
                    event_type   TEXT NOT NULL,
                    source       TEXT NOT NULL,
                    timestamp_ms INTEGER NOT NULL,
                    payload      TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_transcripts_session ON transcripts(session_id);
                CREATE INDEX IF NOT EXISTS idx_audit_session ON audit_events(session_id);
                CREATE INDEX IF NOT EXISTS idx_audit_type ON audit_events(event_type);",
            )?;
            conn.execute(
                "INSERT INTO migrations (version, applied_at) VALUES (?1, ?2)",
                params![1, Utc::now().to_rfc3339()],
            )?;
        }

        debug_assert!(current <= SCHEMA_VERSION);
        Ok(())
    }

    // ── Users ───────────────────────────────────────────────────────

    /// Insert-or-touch a user keyed by fingerprint. Returns the row plus
    /// how many sessions the user had before this call.
    pub fn upsert_user(&self, fingerprint: &str) -> Result<UserRecord> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();

        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT id, first_seen_at FROM users WHERE fingerprint = ?1",
                params![fingerprint],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let (id, first_seen_at) = match existing {
            Some((id, first_seen)) => {
                conn.execute(
                    "UPDATE users SET last_seen_at = ?1 WHERE id = ?2",
                    params![now, id],
                )?;
                (id, first_seen)
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO users (id, fingerprint, first_seen_at, last_seen_at)
                     VALUES (?1, ?2, ?3, ?3)",
                    params![id, fingerprint, now],
                )?;
                (id, now.clone())
            }
        };

        let previous_session_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE user_id = ?1",
            params![id],
            |r| r.get(0),
        )?;

        Ok(UserRecord {
            id,
            fingerprint: fingerprint.to_string(),
            first_seen_at,
            last_seen_at: now,
            previous_session_count,
        })
    }

    // ── Sessions ────────────────────────────────────────────────────

    pub fn insert_session(&self, session_id: &str, user_id: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO sessions (id, user_id, started_at) VALUES (?1, ?2, ?3)",
            params![session_id, user_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn end_session(&self, session_id: &str, reason: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET ended_at = ?1, end_reason = ?2 WHERE id = ?3",
            params![Utc::now().to_rfc3339(), reason, session_id],
        )?;
        Ok(())
    }

    /// Idempotent parent-row guarantee for the audit ingest path. The FK
    /// would reject an orphan event row; this makes insert ordering a code
    /// invariant instead of a constraint violation.
    pub fn ensure_session_row(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO sessions (id, started_at) VALUES (?1, ?2)",
            params![session_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn session_exists(&self, session_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM sessions WHERE id = ?1",
                params![session_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ── Transcripts ─────────────────────────────────────────────────

    /// Write a transcript entry with streaming collapse: if the newest row
    /// for (session, role) is non-final, it is overwritten in place;
    /// otherwise a new row is inserted. Runs inside a transaction.
    pub fn upsert_transcript(&self, entry: &TranscriptEntry) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let open_row: Option<i64> = tx
            .query_row(
                "SELECT id FROM transcripts
                 WHERE session_id = ?1 AND role = ?2 AND is_final = 0
                 ORDER BY id DESC LIMIT 1",
                params![entry.session_id, entry.role.as_str()],
                |r| r.get(0),
            )
            .optional()?;

        match open_row {
            Some(id) => {
                tx.execute(
                    "UPDATE transcripts
                     SET content = ?1, confidence = ?2, timestamp_ms = ?3, is_final = ?4
                     WHERE id = ?5",
                    params![
                        entry.content,
                        entry.confidence,
                        entry.timestamp_ms as i64,
                        entry.is_final as i64,
                        id
                    ],
                )?;
            }
            None => {
                tx.execute(
                    "INSERT INTO transcripts
                        (session_id, user_id, role, content, confidence, timestamp_ms, is_final)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        entry.session_id,
                        entry.user_id,
                        entry.role.as_str(),
                        entry.content,
                        entry.confidence,
                        entry.timestamp_ms as i64,
                        entry.is_final as i64
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    pub fn transcripts_for_session(&self, session_id: &str) -> Result<Vec<TranscriptEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, user_id, role, content, confidence, timestamp_ms, is_final
             FROM transcripts WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |r| {
            Ok(TranscriptEntry {
                session_id: r.get(0)?,
                user_id: r.get(1)?,
                role: Role::from_str_lossy(&r.get::<_, String>(2)?),
                content: r.get(3)?,
                confidence: r.get(4)?,
                timestamp_ms: r.get::<_, i64>(5)? as u64,
                is_final: r.get::<_, i64>(6)? != 0,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ── Summaries ───────────────────────────────────────────────────

    pub fn insert_summary(&self, summary: &ConversationSummary) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conversation_summaries
                (user_id, from_session_id, to_session_id, summary, turn_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                summary.user_id,
                summary.from_session_id,
                summary.to_session_id,
                summary.summary,
                summary.turn_count,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn latest_summary_for_user(&self, user_id: &str) -> Result<Option<ConversationSummary>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_id, from_session_id, to_session_id, summary, turn_count
             FROM conversation_summaries WHERE user_id = ?1
             ORDER BY id DESC LIMIT 1",
            params![user_id],
            |r| {
                Ok(ConversationSummary {
                    user_id: r.get(0)?,
                    from_session_id: r.get(1)?,
                    to_session_id: r.get(2)?,
                    summary: r.get(3)?,
                    turn_count: r.get(4)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    // ── Audit events ────────────────────────────────────────────────

    /// FK-safe audit insert: the parent session row is created if absent,
    /// then the event row goes in. Duplicate event ids are ignored.
    pub fn insert_audit_event(&self, row: &AuditEventRow) -> Result<()> {
        self.ensure_session_row(&row.session_id)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO audit_events
                (event_id, session_id, event_type, source, timestamp_ms, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.event_id,
                row.session_id,
                row.event_type,
                row.source,
                row.timestamp_ms as i64,
                row.payload
            ],
        )?;
        Ok(())
    }

    pub fn audit_events_for_session(&self, session_id: &str) -> Result<Vec<AuditEventRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT event_id, session_id, event_type, source, timestamp_ms, payload
             FROM audit_events WHERE session_id = ?1 ORDER BY timestamp_ms ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |r| {
            Ok(AuditEventRow {
                event_id: r.get(0)?,
                session_id: r.get(1)?,
                event_type: r.get(2)?,
                source: r.get(3)?,
                timestamp_ms: r.get::<_, i64>(4)? as u64,
                payload: r.get(5)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> SqlStore {
        SqlStore::open_in_memory().unwrap()
    }

    fn entry(session: &str, role: Role, content: &str, is_final: bool) -> TranscriptEntry {
        TranscriptEntry {
            session_id: session.into(),
            user_id: None,
            role,
            content: content.into(),
            confidence: 0.9,
            timestamp_ms: 1_000,
            is_final,
        }
    }

    #[test]
    fn open_on_disk_applies_wal() {
        let tmp = TempDir::new().unwrap();
        let store = SqlStore::open(&tmp.path().join("gw.db"), true).unwrap();
        store.insert_session("s1", None).unwrap();
        assert!(store.session_exists("s1").unwrap());
    }

    #[test]
    fn migration_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gw.db");
        drop(SqlStore::open(&path, false).unwrap());
        // Second open re-runs migrate against the populated version table.
        let store = SqlStore::open(&path, false).unwrap();
        store.insert_session("s1", None).unwrap();
    }

    #[test]
    fn upsert_user_tracks_returning_users() {
        let store = store();
        let first = store.upsert_user("fp-123").unwrap();
        assert_eq!(first.previous_session_count, 0);

        store.insert_session("s1", Some(&first.id)).unwrap();
        let second = store.upsert_user("fp-123").unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.previous_session_count, 1);
    }

    #[test]
    fn distinct_fingerprints_get_distinct_users() {
        let store = store();
        let a = store.upsert_user("fp-a").unwrap();
        let b = store.upsert_user("fp-b").unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn streaming_transcript_collapses_nonfinal() {
        let store = store();
        store.insert_session("s1", None).unwrap();

        store
            .upsert_transcript(&entry("s1", Role::Assistant, "Hel", false))
            .unwrap();
        store
            .upsert_transcript(&entry("s1", Role::Assistant, "Hello wo", false))
            .unwrap();
        store
            .upsert_transcript(&entry("s1", Role::Assistant, "Hello world", true))
            .unwrap();

        let rows = store.transcripts_for_session("s1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "Hello world");
        assert!(rows[0].is_final);
    }

    #[test]
    fn final_rows_do_not_collapse_each_other() {
        let store = store();
        store.insert_session("s1", None).unwrap();

        store
            .upsert_transcript(&entry("s1", Role::User, "first turn", true))
            .unwrap();
        store
            .upsert_transcript(&entry("s1", Role::User, "second turn", true))
            .unwrap();

        let rows = store.transcripts_for_session("s1").unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn roles_collapse_independently() {
        let store = store();
        store.insert_session("s1", None).unwrap();

        store
            .upsert_transcript(&entry("s1", Role::User, "user partial", false))
            .unwrap();
        store
            .upsert_transcript(&entry("s1", Role::Assistant, "asst partial", false))
            .unwrap();
        store
            .upsert_transcript(&entry("s1", Role::User, "user final", true))
            .unwrap();

        let rows = store.transcripts_for_session("s1").unwrap();
        assert_eq!(rows.len(), 2);
        let user_row = rows.iter().find(|r| r.role == Role::User).unwrap();
        assert_eq!(user_row.content, "user final");
        let asst_row = rows.iter().find(|r| r.role == Role::Assistant).unwrap();
        assert!(!asst_row.is_final);
    }

    #[test]
    fn audit_insert_creates_parent_session() {
        let store = store();
        // No session row yet; ingest must still succeed.
        store
            .insert_audit_event(&AuditEventRow {
                event_id: "e1".into(),
                session_id: "orphanless".into(),
                event_type: "policy.decision".into(),
                source: "laneC".into(),
                timestamp_ms: 42,
                payload: "{}".into(),
            })
            .unwrap();

        assert!(store.session_exists("orphanless").unwrap());
        let events = store.audit_events_for_session("orphanless").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "policy.decision");
    }

    #[test]
    fn duplicate_audit_event_ids_are_ignored() {
        let store = store();
        let row = AuditEventRow {
            event_id: "dup".into(),
            session_id: "s1".into(),
            event_type: "control.audit".into(),
            source: "laneC".into(),
            timestamp_ms: 1,
            payload: "{}".into(),
        };
        store.insert_audit_event(&row).unwrap();
        store.insert_audit_event(&row).unwrap();
        assert_eq!(store.audit_events_for_session("s1").unwrap().len(), 1);
    }

    #[test]
    fn end_session_records_reason() {
        let store = store();
        store.insert_session("s1", None).unwrap();
        store.end_session("s1", "timeout").unwrap();

        let conn = store.conn.lock();
        let reason: String = conn
            .query_row(
                "SELECT end_reason FROM sessions WHERE id = 's1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(reason, "timeout");
    }

    #[test]
    fn summaries_roundtrip() {
        let store = store();
        let user = store.upsert_user("fp-1").unwrap();
        store.insert_session("s1", Some(&user.id)).unwrap();

        store
            .insert_summary(&ConversationSummary {
                user_id: user.id.clone(),
                from_session_id: "s1".into(),
                to_session_id: None,
                summary: "Asked about pricing".into(),
                turn_count: 4,
            })
            .unwrap();

        let latest = store.latest_summary_for_user(&user.id).unwrap().unwrap();
        assert_eq!(latest.summary, "Asked about pricing");
        assert_eq!(latest.turn_count, 4);
    }
}
