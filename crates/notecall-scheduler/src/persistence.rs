//! SQLite-backed note repository: users, notes, per-user schedule state and
//! the reminder log. Survives restarts; schedule state is written with a
//! single upsert so a user's row is never half-updated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use notecall_core::traits::NoteRepository;
use notecall_core::{
    Note, NoteKind, ReminderOutcome, ReminderRecord, StorageError, UserId, UserScheduleState,
};

/// SQLite-backed persistence store for notes and scheduling data.
pub struct NoteDb {
    conn: Mutex<Connection>,
}

impl NoteDb {
    /// Open or create the note database.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Fatal(format!("DB dir: {e}")))?;
        }
        let conn = Connection::open(path).map_err(map_sqlite_err)?;
        Self::init(conn)
    }

    /// Throwaway in-memory database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory().map_err(map_sqlite_err)?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(map_sqlite_err)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<(), StorageError> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                username TEXT,
                first_name TEXT,
                last_name TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS notes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                note_type TEXT NOT NULL DEFAULT 'text',  -- text, image, voice, document, video, audio
                content TEXT NOT NULL,                   -- text or caption
                file_path TEXT,                          -- stored media file
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notes_user_id ON notes(user_id);

            -- One row per user, replaced atomically
            CREATE TABLE IF NOT EXISTS schedule_state (
                user_id TEXT PRIMARY KEY,
                last_evaluated_day INTEGER,
                next_fire_at TEXT,
                last_fired_at TEXT,
                last_outcome TEXT,
                last_outcome_detail TEXT,
                fire_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reminder_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                note_id INTEGER,
                outcome TEXT NOT NULL,          -- delivered, delivered_fallback, no_notes, ...
                detail TEXT,
                created_at TEXT NOT NULL
            );
         ",
            )
            .map_err(map_sqlite_err)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Fatal(format!("DB lock poisoned: {e}")))
    }

    // ─── Users & Notes ────────────────────────────────────────

    /// Save or update a user.
    pub fn save_user(
        &self,
        user_id: &str,
        username: Option<&str>,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> Result<(), StorageError> {
        let now = Utc::now().to_rfc3339();
        self.conn()?
            .execute(
                "INSERT INTO users (user_id, username, first_name, last_name, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                    username = excluded.username,
                    first_name = excluded.first_name,
                    last_name = excluded.last_name,
                    updated_at = excluded.updated_at",
                params![user_id, username, first_name, last_name, now],
            )
            .map_err(map_sqlite_err)?;
        tracing::debug!("👤 User saved: {user_id}");
        Ok(())
    }

    /// Store a note, returning its id.
    pub fn save_note(
        &self,
        user_id: &str,
        kind: NoteKind,
        content: &str,
        file_path: Option<&str>,
    ) -> Result<i64, StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notes (user_id, note_type, content, file_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, kind.as_str(), content, file_path, Utc::now().to_rfc3339()],
        )
        .map_err(map_sqlite_err)?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent reminder log entries, newest first.
    pub fn recent_outcomes(&self, limit: usize) -> Result<Vec<ReminderRecord>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT user_id, note_id, outcome, detail, created_at
                 FROM reminder_log ORDER BY id DESC LIMIT ?1",
            )
            .map_err(map_sqlite_err)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(map_sqlite_err)?;

        let mut records = Vec::new();
        for row in rows {
            let (user_id, note_id, label, detail, at) = row.map_err(map_sqlite_err)?;
            let Some(outcome) = ReminderOutcome::from_parts(&label, detail) else {
                tracing::warn!("⚠️ Unknown outcome '{label}' in reminder_log, skipping");
                continue;
            };
            records.push(ReminderRecord {
                user_id,
                note_id,
                outcome,
                at: parse_ts(&at)?,
            });
        }
        Ok(records)
    }

    fn count(&self, sql: &str) -> Result<u64, StorageError> {
        self.conn()?
            .query_row(sql, [], |r| r.get::<_, i64>(0))
            .map(|n| n.max(0) as u64)
            .map_err(map_sqlite_err)
    }
}

#[async_trait]
impl NoteRepository for NoteDb {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn list_users(&self) -> Result<Vec<UserId>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT user_id FROM users
                 UNION
                 SELECT DISTINCT user_id FROM notes
                 ORDER BY 1",
            )
            .map_err(map_sqlite_err)?;
        let users = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(map_sqlite_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_sqlite_err)?;
        Ok(users)
    }

    async fn count_notes(&self, user: &str) -> Result<u64, StorageError> {
        self.conn()?
            .query_row(
                "SELECT COUNT(*) FROM notes WHERE user_id = ?1",
                params![user],
                |r| r.get::<_, i64>(0),
            )
            .map(|n| n.max(0) as u64)
            .map_err(map_sqlite_err)
    }

    async fn random_note(&self, user: &str) -> Result<Option<Note>, StorageError> {
        let row = self
            .conn()?
            .query_row(
                "SELECT id, user_id, note_type, content, file_path, created_at
                 FROM notes WHERE user_id = ?1
                 ORDER BY RANDOM() LIMIT 1",
                params![user],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(map_sqlite_err)?;

        row.map(|(id, user_id, kind, content, file_path, created_at)| {
            Ok(Note {
                id,
                user_id,
                kind: NoteKind::parse(&kind),
                payload_ref: file_path,
                caption: content,
                created_at: parse_ts(&created_at)?,
            })
        })
        .transpose()
    }

    async fn load_schedule_state(&self, user: &str) -> Result<UserScheduleState, StorageError> {
        let row = self
            .conn()?
            .query_row(
                "SELECT last_evaluated_day, next_fire_at, last_fired_at,
                        last_outcome, last_outcome_detail, fire_count
                 FROM schedule_state WHERE user_id = ?1",
                params![user],
                |row| {
                    Ok((
                        row.get::<_, Option<i64>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(map_sqlite_err)?;

        let Some((day, next_fire_at, last_fired_at, outcome, detail, fire_count)) = row else {
            return Ok(UserScheduleState::new(user));
        };

        Ok(UserScheduleState {
            user_id: user.to_string(),
            last_evaluated_day: day,
            next_fire_at: next_fire_at.as_deref().map(parse_ts).transpose()?,
            last_fired_at: last_fired_at.as_deref().map(parse_ts).transpose()?,
            last_outcome: outcome.and_then(|label| ReminderOutcome::from_parts(&label, detail)),
            fire_count: u32::try_from(fire_count).unwrap_or(0),
        })
    }

    async fn save_schedule_state(
        &self,
        user: &str,
        state: &UserScheduleState,
    ) -> Result<(), StorageError> {
        self.conn()?
            .execute(
                "INSERT INTO schedule_state
                    (user_id, last_evaluated_day, next_fire_at, last_fired_at,
                     last_outcome, last_outcome_detail, fire_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(user_id) DO UPDATE SET
                    last_evaluated_day = excluded.last_evaluated_day,
                    next_fire_at = excluded.next_fire_at,
                    last_fired_at = excluded.last_fired_at,
                    last_outcome = excluded.last_outcome,
                    last_outcome_detail = excluded.last_outcome_detail,
                    fire_count = excluded.fire_count,
                    updated_at = excluded.updated_at",
                params![
                    user,
                    state.last_evaluated_day,
                    state.next_fire_at.map(|t| t.to_rfc3339()),
                    state.last_fired_at.map(|t| t.to_rfc3339()),
                    state.last_outcome.as_ref().map(|o| o.label()),
                    state.last_outcome.as_ref().and_then(|o| o.detail()),
                    i64::from(state.fire_count),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(map_sqlite_err)?;
        Ok(())
    }

    async fn record_outcome(&self, record: &ReminderRecord) -> Result<(), StorageError> {
        self.conn()?
            .execute(
                "INSERT INTO reminder_log (user_id, note_id, outcome, detail, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.user_id,
                    record.note_id,
                    record.outcome.label(),
                    record.outcome.detail(),
                    record.at.to_rfc3339(),
                ],
            )
            .map_err(map_sqlite_err)?;
        Ok(())
    }

    async fn total_users(&self) -> Result<u64, StorageError> {
        self.count(
            "SELECT COUNT(*) FROM (SELECT user_id FROM users UNION SELECT user_id FROM notes)",
        )
    }

    async fn total_notes(&self) -> Result<u64, StorageError> {
        self.count("SELECT COUNT(*) FROM notes")
    }
}

/// Busy/locked databases are worth retrying; anything else is not.
fn map_sqlite_err(e: rusqlite::Error) -> StorageError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StorageError::Transient(e.to_string())
        }
        _ => StorageError::Fatal(e.to_string()),
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Fatal(format!("bad timestamp '{s}': {e}")))
}
