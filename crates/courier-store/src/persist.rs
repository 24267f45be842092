use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, warn};

use courier_core::Message;

use crate::error::{Result, StoreError};
use crate::types::{Pin, SessionSnapshot, SubAgentRecord, SubAgentStatus};

/// Durable write-through store for sessions, pins, and sub-agents.
///
/// Wraps a single SQLite connection in a `Mutex`; the backend serializes
/// writers, which is sufficient for a single-node gateway. `close()` takes
/// the connection out, so late writers get `StoreError::Closed` instead of
/// touching a half-torn-down handle.
pub struct SqlitePersister {
    db: Mutex<Option<Connection>>,
}

impl SqlitePersister {
    /// Open (or create) the database at `path`, creating parent directories
    /// and the schema as needed.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(Some(conn)),
        })
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(Some(conn)),
        })
    }

    /// Flush and drop the connection. Subsequent calls fail with `Closed`.
    pub fn close(&self) {
        let mut guard = self.db.lock().unwrap();
        if let Some(conn) = guard.take() {
            if let Err((_, e)) = conn.close() {
                warn!(error = %e, "error closing persister connection");
            }
        }
    }

    // ── Sessions ───────────────────────────────────────────────────────────

    /// Upsert the full session state in one statement — either the new row is
    /// visible or the previous one remains.
    pub fn save_session(
        &self,
        key: &str,
        messages: &[Message],
        model: Option<&str>,
        profile: Option<&str>,
    ) -> Result<()> {
        let blob = serde_json::to_string(messages)?;
        let now = chrono::Utc::now().to_rfc3339();
        let guard = self.db.lock().unwrap();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        db.execute(
            "INSERT INTO sessions (key, messages, model, profile, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                 messages   = excluded.messages,
                 model      = excluded.model,
                 profile    = excluded.profile,
                 updated_at = excluded.updated_at",
            rusqlite::params![key, blob, model, profile, now],
        )?;
        debug!(key, count = messages.len(), "session saved");
        Ok(())
    }

    /// Load every stored session. A row whose message blob fails to decode is
    /// skipped with a warning; the rest load.
    pub fn load_all(&self) -> Result<Vec<SessionSnapshot>> {
        let guard = self.db.lock().unwrap();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        let mut stmt =
            db.prepare("SELECT key, messages, model, profile, updated_at FROM sessions")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (key, blob, model, profile, updated_at) = match row {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable session row");
                    continue;
                }
            };
            match serde_json::from_str::<Vec<Message>>(&blob) {
                Ok(messages) => out.push(SessionSnapshot {
                    key,
                    messages,
                    model,
                    profile,
                    updated_at,
                }),
                Err(e) => {
                    warn!(key, error = %e, "skipping session row with corrupt message blob");
                }
            }
        }
        Ok(out)
    }

    /// Load one session by key, `None` when absent or corrupt.
    pub fn load_session(&self, key: &str) -> Result<Option<SessionSnapshot>> {
        let guard = self.db.lock().unwrap();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        let row = db.query_row(
            "SELECT key, messages, model, profile, updated_at FROM sessions WHERE key = ?1",
            rusqlite::params![key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        );
        let (key, blob, model, profile, updated_at) = match row {
            Ok(r) => r,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(StoreError::Database(e)),
        };
        match serde_json::from_str::<Vec<Message>>(&blob) {
            Ok(messages) => Ok(Some(SessionSnapshot {
                key,
                messages,
                model,
                profile,
                updated_at,
            })),
            Err(e) => {
                warn!(key, error = %e, "session row has corrupt message blob");
                Ok(None)
            }
        }
    }

    // ── Pins ───────────────────────────────────────────────────────────────

    pub fn save_pin(&self, pin: &Pin) -> Result<()> {
        let guard = self.db.lock().unwrap();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        db.execute(
            "INSERT INTO pins (id, session_key, text, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET text = excluded.text",
            rusqlite::params![pin.id, pin.session_key, pin.text, pin.created_at],
        )?;
        Ok(())
    }

    pub fn load_pins_by_session(&self, session_key: &str) -> Result<Vec<Pin>> {
        let guard = self.db.lock().unwrap();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        let mut stmt = db.prepare(
            "SELECT id, session_key, text, created_at FROM pins
             WHERE session_key = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(rusqlite::params![session_key], |row| {
            Ok(Pin {
                id: row.get(0)?,
                session_key: row.get(1)?,
                text: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn delete_pin(&self, id: &str) -> Result<()> {
        let guard = self.db.lock().unwrap();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        let n = db.execute("DELETE FROM pins WHERE id = ?1", rusqlite::params![id])?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: "pin",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ── Sub-agents ─────────────────────────────────────────────────────────

    pub fn save_subagent(&self, record: &SubAgentRecord) -> Result<()> {
        let guard = self.db.lock().unwrap();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        db.execute(
            "INSERT INTO subagents
                 (id, label, task, system_prompt, status, result, error,
                  started_at, completed_at, parent_session_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                 status       = excluded.status,
                 result       = excluded.result,
                 error        = excluded.error,
                 completed_at = excluded.completed_at",
            rusqlite::params![
                record.id,
                record.label,
                record.task,
                record.system_prompt,
                record.status.as_str(),
                record.result,
                record.error,
                record.started_at.to_rfc3339(),
                record.completed_at.map(|t| t.to_rfc3339()),
                record.parent_session_key,
            ],
        )?;
        Ok(())
    }

    pub fn delete_subagent(&self, id: &str) -> Result<()> {
        let guard = self.db.lock().unwrap();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        let n = db.execute("DELETE FROM subagents WHERE id = ?1", rusqlite::params![id])?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: "subagent",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Rows still marked pending or running — i.e. interrupted by a restart.
    pub fn load_pending_subagents(&self) -> Result<Vec<SubAgentRecord>> {
        self.load_subagents_where("WHERE status IN ('pending', 'running')")
    }

    pub fn load_all_subagents(&self) -> Result<Vec<SubAgentRecord>> {
        self.load_subagents_where("")
    }

    fn load_subagents_where(&self, clause: &str) -> Result<Vec<SubAgentRecord>> {
        let guard = self.db.lock().unwrap();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        let sql = format!(
            "SELECT id, label, task, system_prompt, status, result, error,
                    started_at, completed_at, parent_session_key
             FROM subagents {clause} ORDER BY started_at"
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, label, task, system_prompt, status, result, error, started, completed, parent) =
                match row {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "skipping unreadable subagent row");
                        continue;
                    }
                };
            let status: SubAgentStatus = match status.parse() {
                Ok(s) => s,
                Err(e) => {
                    warn!(id, error = %e, "skipping subagent row with unknown status");
                    continue;
                }
            };
            out.push(SubAgentRecord {
                id,
                label,
                task,
                system_prompt,
                status,
                result,
                error,
                started_at: parse_rfc3339(&started),
                completed_at: completed.as_deref().map(parse_rfc3339),
                parent_session_key: parent,
            });
        }
        Ok(out)
    }
}

fn parse_rfc3339(s: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}

/// Initialise the schema. Safe to call on every startup — `IF NOT EXISTS`
/// throughout; evolution is additive.
fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            key        TEXT PRIMARY KEY,
            messages   TEXT NOT NULL,
            model      TEXT,
            profile    TEXT,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS pins (
            id          TEXT PRIMARY KEY,
            session_key TEXT NOT NULL,
            text        TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pins_session ON pins(session_key, created_at);
        CREATE TABLE IF NOT EXISTS subagents (
            id                 TEXT PRIMARY KEY,
            label              TEXT NOT NULL,
            task               TEXT NOT NULL,
            system_prompt      TEXT,
            status             TEXT NOT NULL,
            result             TEXT,
            error              TEXT,
            started_at         TEXT NOT NULL,
            completed_at       TEXT,
            parent_session_key TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_subagents_status ON subagents(status);",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::message::meta;

    fn persister() -> SqlitePersister {
        SqlitePersister::open_in_memory().unwrap()
    }

    #[test]
    fn session_round_trip() {
        let p = persister();
        let messages = vec![
            Message::user("telegram", "alice", "hi").with_meta(meta::USER_ID, "123"),
            Message::assistant("telegram", "hello").with_meta("x_unknown", 42),
        ];
        p.save_session("telegram:123", &messages, Some("claude-opus-4-6"), None)
            .unwrap();

        let all = p.load_all().unwrap();
        assert_eq!(all.len(), 1);
        let snap = &all[0];
        assert_eq!(snap.key, "telegram:123");
        assert_eq!(snap.messages, messages);
        assert_eq!(snap.model.as_deref(), Some("claude-opus-4-6"));
        assert_eq!(snap.profile, None);
    }

    #[test]
    fn save_overwrites_previous_state() {
        let p = persister();
        let first = vec![Message::user("telegram", "a", "one")];
        let second = vec![
            Message::user("telegram", "a", "one"),
            Message::assistant("telegram", "two"),
        ];
        p.save_session("k", &first, None, None).unwrap();
        p.save_session("k", &second, None, Some("pirate")).unwrap();

        let snap = p.load_session("k").unwrap().unwrap();
        assert_eq!(snap.messages.len(), 2);
        assert_eq!(snap.profile.as_deref(), Some("pirate"));
    }

    #[test]
    fn corrupt_row_is_skipped() {
        let p = persister();
        p.save_session("good", &[Message::user("t", "u", "x")], None, None)
            .unwrap();
        {
            let guard = p.db.lock().unwrap();
            let db = guard.as_ref().unwrap();
            db.execute(
                "INSERT INTO sessions (key, messages, model, profile, updated_at)
                 VALUES ('bad', 'not json at all', NULL, NULL, '2026-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        }
        let all = p.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, "good");
        assert!(p.load_session("bad").unwrap().is_none());
    }

    #[test]
    fn pins_crud() {
        let p = persister();
        let pin = Pin::new("telegram:1", "remember the milk");
        p.save_pin(&pin).unwrap();
        let other = Pin::new("telegram:2", "unrelated");
        p.save_pin(&other).unwrap();

        let pins = p.load_pins_by_session("telegram:1").unwrap();
        assert_eq!(pins.len(), 1);
        assert_eq!(pins[0], pin);

        p.delete_pin(&pin.id).unwrap();
        assert!(p.load_pins_by_session("telegram:1").unwrap().is_empty());
        assert!(matches!(
            p.delete_pin(&pin.id),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn subagent_round_trip_and_pending_filter() {
        let p = persister();
        let mut running = SubAgentRecord::new("scan logs", "scanner", None, "telegram:1");
        running.status = SubAgentStatus::Running;
        let mut done = SubAgentRecord::new("old job", "done-job", Some("be brief"), "telegram:1");
        done.status = SubAgentStatus::Done;
        done.result = Some("42".to_string());
        done.completed_at = Some(chrono::Utc::now());

        p.save_subagent(&running).unwrap();
        p.save_subagent(&done).unwrap();

        let pending = p.load_pending_subagents().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, running.id);

        let all = p.load_all_subagents().unwrap();
        assert_eq!(all.len(), 2);

        p.delete_subagent(&done.id).unwrap();
        assert_eq!(p.load_all_subagents().unwrap().len(), 1);
    }

    #[test]
    fn closed_persister_rejects_writes() {
        let p = persister();
        p.close();
        let err = p
            .save_session("k", &[], None, None)
            .expect_err("save after close must fail");
        assert!(matches!(err, StoreError::Closed));
    }

    #[test]
    fn on_disk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/courier.db");
        let path_str = path.to_str().unwrap();

        {
            let p = SqlitePersister::open(path_str).unwrap();
            p.save_session("k", &[Message::user("t", "u", "persisted")], None, None)
                .unwrap();
            p.close();
        }

        let p = SqlitePersister::open(path_str).unwrap();
        let all = p.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].messages[0].text, "persisted");
    }
}
