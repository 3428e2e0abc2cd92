//! Senlin storage crate - SQLite persistence for action records.
//!
//! Provides a WAL-mode SQLite database with migrations and an
//! [`ActionStore`](senlin_core::store::ActionStore) implementation whose
//! compare-and-set operations are single conditional `UPDATE` statements.

pub mod db;
pub mod migrations;
pub mod repository;

pub use db::Database;
pub use repository::SqliteActionStore;
