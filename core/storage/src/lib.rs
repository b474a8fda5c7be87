//! Local persistent storage for fieldsync.
//!
//! This module provides a trait-based interface over the device-local store:
//! one CRUD table per entity type, the mutation queue table and a small
//! key-value slot for sync metadata.
//!
//! # Design Principles
//! - Backend isolation: the sync engine only talks to [`LocalStore`]
//! - Async operations: all I/O operations are async
//! - Atomic batches: every write goes through [`WriteBatch`], applied all-or-nothing

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{LocalStore, WriteBatch, WriteOp};
