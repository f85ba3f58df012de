//! Parley Storage crate - SQLite persistence for conversation state.
//!
//! Provides a WAL-mode SQLite database with migrations and the
//! [`RecordStore`] seam the session actors persist through, with a
//! SQLite-backed implementation and an in-memory one for tests.

pub mod db;
pub mod migrations;
pub mod records;

pub use db::Database;
pub use records::{MemoryRecordStore, RecordKey, RecordStore, SqliteRecordStore};
