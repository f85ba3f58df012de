//! Keyed JSON record storage.
//!
//! The session actors persist whole logical records (a message list, a
//! context map, a summary list) and never partial rows, so the storage
//! seam is a small load/save/delete interface over JSON documents.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::Value;
use tracing::debug;

use parley_core::error::ParleyError;

use crate::db::Database;

/// Address of one logical record.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub scope: String,
    pub key: String,
    pub name: String,
}

impl RecordKey {
    pub fn new(scope: impl Into<String>, key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            key: key.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.scope, self.key, self.name)
    }
}

/// Durable storage for whole JSON records. Last write wins per key.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Load a record, or `None` if it was never written.
    async fn load(&self, key: &RecordKey) -> Result<Option<Value>, ParleyError>;

    /// Replace a record.
    async fn save(&self, key: &RecordKey, value: Value) -> Result<(), ParleyError>;

    /// Remove a record. Removing a missing record is not an error.
    async fn delete(&self, key: &RecordKey) -> Result<(), ParleyError>;
}

// =============================================================================
// SQLite
// =============================================================================

/// [`RecordStore`] backed by the `records` table.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    db: Arc<Database>,
}

impl SqliteRecordStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, ParleyError>
    where
        F: FnOnce(&Database) -> Result<T, ParleyError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(db.as_ref()))
            .await
            .map_err(|e| ParleyError::Storage(format!("Storage task failed: {}", e)))?
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn load(&self, key: &RecordKey) -> Result<Option<Value>, ParleyError> {
        let k = key.clone();
        let raw: Option<String> = self
            .blocking(move |db| {
                db.with_conn(|conn| {
                    conn.query_row(
                        "SELECT value FROM records WHERE scope = ?1 AND key = ?2 AND name = ?3",
                        rusqlite::params![k.scope, k.key, k.name],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|e| ParleyError::Storage(format!("Failed to load record: {}", e)))
                })
            })
            .await?;

        debug!(record = %key, found = raw.is_some(), "Record loaded");
        raw.map(|text| serde_json::from_str::<Value>(&text).map_err(ParleyError::from))
            .transpose()
    }

    async fn save(&self, key: &RecordKey, value: Value) -> Result<(), ParleyError> {
        let k = key.clone();
        let text = serde_json::to_string(&value)?;
        self.blocking(move |db| {
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO records (scope, key, name, value, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (scope, key, name)
                     DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    rusqlite::params![k.scope, k.key, k.name, text, Utc::now().timestamp()],
                )
                .map_err(|e| ParleyError::Storage(format!("Failed to save record: {}", e)))?;
                Ok(())
            })
        })
        .await?;
        debug!(record = %key, "Record saved");
        Ok(())
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), ParleyError> {
        let k = key.clone();
        self.blocking(move |db| {
            db.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM records WHERE scope = ?1 AND key = ?2 AND name = ?3",
                    rusqlite::params![k.scope, k.key, k.name],
                )
                .map_err(|e| ParleyError::Storage(format!("Failed to delete record: {}", e)))?;
                Ok(())
            })
        })
        .await
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// In-memory [`RecordStore`] for tests.
///
/// Counts loads so callers can observe lazy hydration, and can be told to
/// fail every write to exercise persistence-failure paths.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<RecordKey, Value>>,
    fail_writes: AtomicBool,
    fail_save_at: AtomicUsize,
    saves: AtomicUsize,
    loads: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save`/`delete` fail (or succeed again).
    /// Turning failures off also clears [`Self::fail_from_save`].
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
        if !fail {
            self.fail_save_at.store(0, Ordering::SeqCst);
        }
    }

    /// Fail the `n`th `save` call from now (1-based) and every one after it.
    pub fn fail_from_save(&self, n: usize) {
        let seen = self.saves.load(Ordering::SeqCst);
        self.fail_save_at.store(seen + n.max(1), Ordering::SeqCst);
    }

    /// Number of `save` calls attempted so far, failed ones included.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Number of `load` calls served so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Direct read of a record, bypassing the load counter.
    pub fn peek(&self, key: &RecordKey) -> Option<Value> {
        self.records.lock().ok().and_then(|r| r.get(key).cloned())
    }

    fn check_writable(&self) -> Result<(), ParleyError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ParleyError::Storage("simulated write failure".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<RecordKey, Value>>, ParleyError> {
        self.records
            .lock()
            .map_err(|e| ParleyError::Storage(format!("Record map lock poisoned: {}", e)))
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load(&self, key: &RecordKey) -> Result<Option<Value>, ParleyError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.lock()?.get(key).cloned())
    }

    async fn save(&self, key: &RecordKey, value: Value) -> Result<(), ParleyError> {
        let attempt = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        let fail_at = self.fail_save_at.load(Ordering::SeqCst);
        if fail_at != 0 && attempt >= fail_at {
            return Err(ParleyError::Storage(format!(
                "simulated failure on save {}",
                attempt
            )));
        }
        self.check_writable()?;
        self.lock()?.insert(key.clone(), value);
        Ok(())
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), ParleyError> {
        self.check_writable()?;
        self.lock()?.remove(key);
        Ok(())
    }
}
