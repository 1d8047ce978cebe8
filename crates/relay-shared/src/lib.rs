//! # relay-shared
//!
//! Types shared by every Relay crate: identifiers, the bucket clock that
//! partitions a conversation's timeline, and the records exchanged with the
//! replication backend.

pub mod bucket;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use bucket::BucketClock;
pub use error::RelayError;
pub use types::{AgentKey, ConversationId, CorrelationId, EntryHandle, MessageHash};
