//! The conversation database.
//!
//! One rusqlite connection behind a mutex, opened in WAL mode and migrated
//! to the latest schema before it is handed out.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

use parley_core::error::ParleyError;

use crate::migrations;

const PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     PRAGMA busy_timeout = 5000;";

/// SQLite handle shared by every record store.
///
/// rusqlite's `Connection` is not `Sync`, so access is serialized through
/// [`Database::with_conn`]. Async callers reach it via `spawn_blocking`.
pub struct Database {
    conn: Mutex<Connection>,
    location: Option<PathBuf>,
}

impl Database {
    /// Open or create the database file at `path`, creating parent
    /// directories as needed.
    pub fn new(path: &Path) -> Result<Self, ParleyError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| {
            ParleyError::Storage(format!("failed to open {}: {}", path.display(), e))
        })?;
        let db = Self::prepare(conn, Some(path.to_path_buf()))?;
        info!(path = %path.display(), "Conversation database opened");
        Ok(db)
    }

    /// A private in-memory database, used by tests.
    pub fn in_memory() -> Result<Self, ParleyError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ParleyError::Storage(format!("failed to open in-memory db: {}", e)))?;
        Self::prepare(conn, None)
    }

    fn prepare(conn: Connection, location: Option<PathBuf>) -> Result<Self, ParleyError> {
        conn.execute_batch(PRAGMAS)
            .map_err(|e| ParleyError::Storage(format!("failed to set pragmas: {}", e)))?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            location,
        })
    }

    /// File backing this database; `None` when in memory.
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// Run `f` with the connection locked.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, ParleyError>
    where
        F: FnOnce(&Connection) -> Result<T, ParleyError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|_| ParleyError::Storage("database lock poisoned".to_string()))?;
        f(&conn)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_text(db: &Database, sql: &str) -> String {
        db.with_conn(|conn| {
            conn.query_row(sql, [], |row| row.get::<_, String>(0))
                .map_err(|e| ParleyError::Storage(e.to_string()))
        })
        .unwrap()
    }

    fn record_count(db: &Database) -> i64 {
        db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
                .map_err(|e| ParleyError::Storage(e.to_string()))
        })
        .unwrap()
    }

    #[test]
    fn test_in_memory_has_empty_records_table() {
        let db = Database::in_memory().unwrap();
        assert_eq!(record_count(&db), 0);
        assert!(db.location().is_none());
    }

    #[test]
    fn test_creates_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("parley.db");
        let db = Database::new(&path).unwrap();
        assert!(path.exists());
        assert_eq!(db.location(), Some(path.as_path()));
        assert_eq!(record_count(&db), 0);
    }

    #[test]
    fn test_file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&dir.path().join("wal.db")).unwrap();
        assert_eq!(query_text(&db, "PRAGMA journal_mode"), "wal");
    }

    #[test]
    fn test_reopen_keeps_rows_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.db");
        {
            let db = Database::new(&path).unwrap();
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO records (scope, key, name, value, updated_at)
                     VALUES ('session', 's1', 'messages', '[]', 1704067200)",
                    [],
                )
                .map_err(|e| ParleyError::Storage(e.to_string()))
            })
            .unwrap();
        }
        let db = Database::new(&path).unwrap();
        assert_eq!(record_count(&db), 1);
        assert_eq!(
            query_text(&db, "SELECT CAST(MAX(version) AS TEXT) FROM schema_migrations"),
            "1"
        );
    }
}
