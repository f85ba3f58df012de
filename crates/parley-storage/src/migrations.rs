//! Database schema migrations.
//!
//! Applies the record schema and tracks applied versions in the
//! schema_migrations table.

use rusqlite::Connection;
use tracing::info;

use parley_core::error::ParleyError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), ParleyError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| ParleyError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| ParleyError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: records");
    }

    Ok(())
}

/// Version 1: one JSON document per (scope, key, name).
///
/// Session logs use scope `session` with the conversation id as key and
/// the names `messages` and `user_context`. The conversation directory
/// uses scope `directory` and the name `summaries`.
fn apply_v1(conn: &Connection) -> Result<(), ParleyError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS records (
            scope       TEXT NOT NULL,
            key         TEXT NOT NULL,
            name        TEXT NOT NULL,
            value       TEXT NOT NULL,
            updated_at  INTEGER NOT NULL,
            PRIMARY KEY (scope, key, name)
        );

        CREATE INDEX IF NOT EXISTS idx_records_updated
            ON records (scope, updated_at DESC);

        INSERT INTO schema_migrations (version, name) VALUES (1, 'records');
        ",
    )
    .map_err(|e| ParleyError::Storage(format!("Migration v1 failed: {}", e)))?;
    Ok(())
}
