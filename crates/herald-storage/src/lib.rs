//! Herald storage crate - the persistence collaborator boundary.
//!
//! Defines the async `Persistence` trait used for sender profiles and
//! interaction history, with an in-memory implementation and a WAL-mode
//! SQLite implementation with schema migrations.

pub mod db;
pub mod error;
pub mod memory;
pub mod migrations;
pub mod persistence;
pub mod sqlite;

pub use db::Database;
pub use error::StorageError;
pub use memory::MemoryStore;
pub use persistence::{HistoryRecord, Persistence};
pub use sqlite::SqliteStore;
