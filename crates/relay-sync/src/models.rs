//! In-memory view of a conversation's messages.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use relay_shared::protocol::{FileDescriptor, MessageRecord};
use relay_shared::{AgentKey, CorrelationId, EntryHandle, MessageHash, RelayError};

/// Delivery state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Sent locally, not yet committed.
    Pending,
    /// Committed by the backend.
    Confirmed,
    Delivered,
    Read,
    /// The backend rejected or never answered the submit.
    Failed,
}

impl MessageStatus {
    /// Whether the backend has committed the message.
    pub fn is_confirmed(self) -> bool {
        !matches!(self, Self::Pending | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    /// Waiting for upload (outgoing) or download (incoming).
    Pending,
    Loading,
    Loaded,
    Error,
}

/// An image attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Image {
    pub name: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
    pub file_type: String,
    /// `None` until the bytes have been uploaded.
    pub storage_entry_hash: Option<EntryHandle>,
    /// `data:<mime>;base64,...` once the bytes are available locally.
    pub data_url: Option<String>,
    pub status: ImageStatus,
}

impl Image {
    /// An image known only by its descriptor; its bytes still need fetching.
    pub fn from_descriptor(descriptor: &FileDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            last_modified: descriptor.last_modified,
            size: descriptor.size,
            file_type: descriptor.file_type.clone(),
            storage_entry_hash: Some(descriptor.storage_entry_hash.clone()),
            data_url: None,
            status: ImageStatus::Pending,
        }
    }

    pub fn to_descriptor(&self) -> Option<FileDescriptor> {
        Some(FileDescriptor {
            name: self.name.clone(),
            last_modified: self.last_modified,
            size: self.size,
            file_type: self.file_type.clone(),
            storage_entry_hash: self.storage_entry_hash.clone()?,
        })
    }

    /// Whether a download is owed and nobody has started it.
    pub fn needs_download(&self) -> bool {
        self.status == ImageStatus::Pending
            && self.data_url.is_none()
            && self.storage_entry_hash.is_some()
    }
}

/// Raw bytes of an image the user is sending.
#[derive(Debug, Clone)]
pub struct OutgoingImage {
    pub name: String,
    pub file_type: String,
    pub last_modified: DateTime<Utc>,
    pub bytes: Bytes,
}

/// A message as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    /// Backend hash once confirmed; a local placeholder while pending.
    pub hash: MessageHash,
    pub author_key: AgentKey,
    pub content: String,
    pub images: Vec<Image>,
    pub bucket: u32,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    pub correlation_id: Option<CorrelationId>,
}

impl Message {
    /// Decode a committed record. The result is always `Confirmed`.
    pub fn from_record(record: &MessageRecord) -> Result<Self, RelayError> {
        let entry = record.decode_entry()?;
        Ok(Self {
            hash: record.hash.clone(),
            author_key: record.author.clone(),
            content: entry.content,
            images: entry.images.iter().map(Image::from_descriptor).collect(),
            bucket: entry.bucket,
            timestamp: record.created_at()?,
            status: MessageStatus::Confirmed,
            correlation_id: entry.correlation_id,
        })
    }

    pub fn is_confirmed(&self) -> bool {
        self.status.is_confirmed()
    }

    pub fn has_pending_images(&self) -> bool {
        self.images.iter().any(Image::needs_download)
    }
}

/// Sort key used everywhere messages are listed: oldest first.
pub(crate) fn chronological(a: &Message, b: &Message) -> std::cmp::Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.hash.cmp(&b.hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_shared::protocol::MessageEntry;

    fn descriptor() -> FileDescriptor {
        FileDescriptor {
            name: "cat.png".to_string(),
            last_modified: Utc::now(),
            size: 4,
            file_type: "image/png".to_string(),
            storage_entry_hash: EntryHandle::new("uhCEkBlob"),
        }
    }

    #[test]
    fn test_from_record_is_confirmed() {
        let entry = MessageEntry {
            content: "hi".to_string(),
            bucket: 2,
            images: vec![descriptor()],
            correlation_id: None,
        };
        let record =
            MessageRecord::new(MessageHash::from("h1"), AgentKey::from("bob"), Utc::now(), &entry)
                .unwrap();

        let message = Message::from_record(&record).unwrap();
        assert_eq!(message.status, MessageStatus::Confirmed);
        assert_eq!(message.bucket, 2);
        assert_eq!(message.author_key, AgentKey::from("bob"));
        assert_eq!(message.images[0].status, ImageStatus::Pending);
        assert!(message.has_pending_images());
    }

    #[test]
    fn test_from_record_rejects_missing_entry() {
        let record = MessageRecord {
            hash: MessageHash::from("h1"),
            author: AgentKey::from("bob"),
            timestamp: 0,
            entry: None,
        };
        assert!(Message::from_record(&record).is_err());
    }

    #[test]
    fn test_status_confirmation() {
        assert!(!MessageStatus::Pending.is_confirmed());
        assert!(!MessageStatus::Failed.is_confirmed());
        assert!(MessageStatus::Confirmed.is_confirmed());
        assert!(MessageStatus::Read.is_confirmed());
    }

    #[test]
    fn test_descriptor_requires_upload() {
        let mut image = Image::from_descriptor(&descriptor());
        assert!(image.to_descriptor().is_some());
        image.storage_entry_hash = None;
        assert!(image.to_descriptor().is_none());
        assert!(!image.needs_download());
    }
}
