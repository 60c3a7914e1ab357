//! SQLite persistence.
//!
//! Every operation opens its own connection, so concurrent requests (and
//! concurrent server processes sharing the file) only ever coordinate through
//! SQLite's transactions and constraints.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, Row};

use crate::error::EngineResult;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS questions (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    area               TEXT NOT NULL,
    subtopic           TEXT NOT NULL,
    subtopic_key       TEXT NOT NULL,
    difficulty         TEXT NOT NULL,
    learning_style     TEXT,
    prompt             TEXT NOT NULL,
    options            TEXT NOT NULL,
    correct_option     TEXT NOT NULL,
    explanation        TEXT,
    time_limit_seconds INTEGER,
    origin             TEXT NOT NULL DEFAULT 'bank',
    created_at         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS questions_by_area ON questions (area, subtopic_key);

CREATE TABLE IF NOT EXISTS sessions (
    id              BLOB PRIMARY KEY,
    user_id         BLOB NOT NULL,
    kind            TEXT NOT NULL,
    area            TEXT,
    subtopic        TEXT,
    subtopic_key    TEXT,
    level           INTEGER,
    started_at      TEXT NOT NULL,
    ended_at        TEXT,
    total_questions INTEGER NOT NULL,
    correct_count   INTEGER NOT NULL DEFAULT 0,
    percentage      INTEGER,
    passed          INTEGER
);
CREATE INDEX IF NOT EXISTS sessions_by_user ON sessions (user_id, area, subtopic_key, started_at);

CREATE TABLE IF NOT EXISTS session_details (
    session_id         BLOB NOT NULL REFERENCES sessions (id),
    position           INTEGER NOT NULL,
    question_id        INTEGER REFERENCES questions (id) ON DELETE SET NULL,
    time_limit_seconds INTEGER NOT NULL,
    chosen_option      TEXT,
    is_correct         INTEGER,
    time_spent_seconds INTEGER,
    answered_at        TEXT,
    PRIMARY KEY (session_id, position)
);

CREATE TABLE IF NOT EXISTS level_progress (
    user_id      BLOB NOT NULL,
    area         TEXT NOT NULL,
    level        INTEGER NOT NULL,
    subtopic     TEXT NOT NULL,
    state        TEXT NOT NULL,
    attempts     INTEGER NOT NULL,
    lives        INTEGER NOT NULL,
    last_touched TEXT NOT NULL,
    session_id   BLOB,
    version      INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, area, level)
);

CREATE TABLE IF NOT EXISTS level_progress_history (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id      BLOB NOT NULL,
    area         TEXT NOT NULL,
    level        INTEGER NOT NULL,
    subtopic     TEXT NOT NULL,
    state        TEXT NOT NULL,
    attempts     INTEGER NOT NULL,
    lives        INTEGER NOT NULL,
    touched_at   TEXT NOT NULL,
    session_id   BLOB,
    source       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS level_progress_history_by_key
    ON level_progress_history (user_id, area, level);

CREATE TABLE IF NOT EXISTS learning_styles (
    user_id    BLOB PRIMARY KEY,
    style      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

#[derive(Clone, Debug)]
pub struct Store {
    path: PathBuf,
    busy_timeout: Duration,
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> EngineResult<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout,
        };

        let conn = store.connect()?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        log::debug!("Opened {} (journal_mode={journal_mode})", store.path.display());
        conn.execute_batch(SCHEMA)?;

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A fresh connection. Callers own it for the duration of one operation.
    pub fn connect(&self) -> EngineResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }
}

/// Lost a race for the write lock or a uniqueness constraint.
pub(crate) fn is_contention(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::ConstraintViolation
        ),
        _ => false,
    }
}

/// Read a TEXT column into one of the string-backed enums.
pub(crate) fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_optional_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: Option<String> = row.get(idx)?;
    text.map(|text| {
        text.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A store in a throwaway directory. Keep the `TempDir` alive for the test's duration.
    pub fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("practice.db"), Duration::from_secs(5)).unwrap();
        (dir, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_is_idempotent() {
        let (dir, store) = test_support::temp_store();
        let again = Store::open(store.path(), Duration::from_secs(1)).unwrap();
        let conn = again.connect().unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'level_progress'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
        drop(dir);
    }

    #[test]
    fn test_busy_and_constraint_errors_are_contention() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(is_contention(&busy));
        assert!(!is_contention(&rusqlite::Error::QueryReturnedNoRows));
    }
}
