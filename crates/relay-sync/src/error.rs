use std::time::Duration;

use thiserror::Error;

use relay_shared::{EntryHandle, MessageHash};
use relay_store::StoreError;

/// Errors produced by the sync engine.
///
/// Most engine operations recover internally and only log these; they are
/// surfaced to callers by explicit retry operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The backend reported a failure.
    #[error("Backend call {operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },

    /// The backend did not answer in time.
    #[error("Backend call {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Page loads cannot start past the current bucket.
    #[error("Bucket {bucket} is past the current bucket {current}")]
    InvalidBucket { bucket: u32, current: u32 },

    #[error("Unknown message {0}")]
    UnknownMessage(MessageHash),

    /// Only failed sends can be retried.
    #[error("Message {0} is not awaiting a retry")]
    NotRetryable(MessageHash),

    #[error("Attachment {handle} unavailable after {attempts} attempts")]
    AttachmentUnavailable { handle: EntryHandle, attempts: u32 },
}

impl SyncError {
    pub(crate) fn backend(operation: &'static str, error: anyhow::Error) -> Self {
        Self::Backend {
            operation,
            message: format!("{error:#}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
