//! # relay-store
//!
//! Local persistence for the Relay message-history engine.
//!
//! A conversation's timeline is split into fixed-width time buckets. For
//! each bucket the store remembers which message hashes are known locally
//! ([`BucketIndex`]); a [`HistoryIndex`] groups those per conversation and
//! decides how far back a page load must reach. Records are written through
//! the [`KvStore`] port, backed by SQLite ([`Database`]) in production.

pub mod bucket_index;
pub mod database;
pub mod history_index;
pub mod kv;
pub mod migrations;

mod error;

pub use bucket_index::{BucketIndex, BucketRecord};
pub use database::Database;
pub use error::{Result, StoreError};
pub use history_index::HistoryIndex;
pub use kv::{KvStore, MemoryKvStore};
