//! Records exchanged with the replication backend.
//!
//! The backend stores message entries as opaque payloads next to the
//! metadata of the action that created them (hash, author, timestamp).
//! Entries are decoded lazily so a single malformed record never poisons a
//! batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::types::{AgentKey, ConversationId, CorrelationId, EntryHandle, MessageHash};

/// Attachment metadata carried inside a message entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileDescriptor {
    pub name: String,
    pub last_modified: DateTime<Utc>,
    /// Size in bytes
    pub size: u64,
    /// MIME type, e.g. `image/png`
    pub file_type: String,
    pub storage_entry_hash: EntryHandle,
}

/// The application payload of a message as committed to the backend.
///
/// Also used as the submit input: the backend stores exactly what it is given.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEntry {
    pub content: String,
    /// Time bucket computed by the sender at send time. Never recomputed.
    pub bucket: u32,
    #[serde(default)]
    pub images: Vec<FileDescriptor>,
    /// Echoed back so the sender can match its pending copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

/// A raw record as returned by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRecord {
    /// Hash of the creating action
    pub hash: MessageHash,
    pub author: AgentKey,
    /// Action timestamp in microseconds since the Unix epoch
    pub timestamp: i64,
    /// Undecoded entry payload; `None` when the entry has not been replicated yet
    pub entry: Option<serde_json::Value>,
}

impl MessageRecord {
    pub fn new(
        hash: MessageHash,
        author: AgentKey,
        at: DateTime<Utc>,
        entry: &MessageEntry,
    ) -> Result<Self, RelayError> {
        Ok(Self {
            hash,
            author,
            timestamp: at.timestamp_micros(),
            entry: Some(serde_json::to_value(entry)?),
        })
    }

    /// Decode the entry payload into a [`MessageEntry`].
    pub fn decode_entry(&self) -> Result<MessageEntry, RelayError> {
        let value = self.entry.clone().ok_or_else(|| RelayError::MissingEntry {
            hash: self.hash.to_string(),
        })?;
        serde_json::from_value(value).map_err(|source| RelayError::MalformedEntry {
            hash: self.hash.to_string(),
            source,
        })
    }

    pub fn created_at(&self) -> Result<DateTime<Utc>, RelayError> {
        DateTime::from_timestamp_micros(self.timestamp).ok_or(RelayError::InvalidTimestamp {
            hash: self.hash.to_string(),
            micros: self.timestamp,
        })
    }
}

/// What the backend returns once a submitted message is committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Confirmation {
    pub hash: MessageHash,
    pub timestamp: DateTime<Utc>,
}

/// Push notification of a message committed by some participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RealtimeEvent {
    /// Cell the message was committed in
    pub conversation_id: ConversationId,
    pub author: AgentKey,
    pub record: MessageRecord,
}

/// Participant profile as published in the conversation roster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Profile {
    pub first_name: String,
    pub last_name: String,
    pub avatar: Option<String>,
}
