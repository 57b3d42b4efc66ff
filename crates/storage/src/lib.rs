//! Ravel Storage - adapters, change logs and the transactional database.
//!
//! This crate provides the persistence layer of the Ravel engine:
//!
//! - `MemoryStore`: the in-memory reference `RowStore`
//! - `PlistFileStore` / `PlistDirectoryStore`: plist-backed adapters, plus
//!   the canonical value encoding and plist codec they share
//! - `ChangeLoggingRelation`: a base relation recording mutations in an
//!   append-only log over an underlying store, with snapshots and `save`
//! - `TransactionalDatabase`: a named group of change-logging relations
//!   with nestable transactions and whole-database snapshots
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use ravel_core::{Row, Scheme, Value};
//! use ravel_storage::{MemoryStore, TransactionalDatabase};
//!
//! let db = TransactionalDatabase::new();
//! let pets = db
//!     .add_relation("pets", Arc::new(MemoryStore::new(Scheme::from(["id"]))))
//!     .unwrap();
//!
//! let (_, before, after) = db
//!     .transaction_with_snapshots(|| {
//!         pets.add(Row::new([("id", Value::Integer(1))])).unwrap();
//!     })
//!     .unwrap();
//! assert_ne!(before, after);
//! ```

mod change_log;
mod database;
mod memory;
mod plist;

pub use change_log::{
    apply_change, materialize, ChangeLogSnapshot, ChangeLoggingRelation, LoggedChange,
};
pub use database::{DatabaseSnapshot, TransactionalDatabase};
pub use memory::MemoryStore;
pub use plist::{
    canonical_encoding, decode_row, decode_table, encode_row, encode_table, PlistDirectoryStore,
    PlistFileStore, StreamCodec,
};
