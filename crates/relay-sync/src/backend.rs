//! Port to the replication backend.
//!
//! The engine never talks to the network directly. Everything it needs from
//! the distributed store goes through [`Backend`]; the production
//! implementation wraps the conductor connection, tests use
//! [`MemoryBackend`](crate::memory::MemoryBackend).

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use relay_shared::protocol::{Confirmation, MessageEntry, MessageRecord, Profile};
use relay_shared::{AgentKey, ConversationId, EntryHandle, MessageHash};

use crate::error::SyncError;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Authoritative list of message hashes in one bucket.
    ///
    /// `known_count` is how many the caller already knows; a backend may use
    /// it to skip work, but must still return the full list.
    async fn fetch_message_hashes(
        &self,
        conversation: &ConversationId,
        bucket: u32,
        known_count: usize,
    ) -> anyhow::Result<Vec<MessageHash>>;

    /// Records for the given hashes. May return fewer than requested when
    /// entries have not replicated yet.
    async fn fetch_messages(
        &self,
        conversation: &ConversationId,
        hashes: &[MessageHash],
    ) -> anyhow::Result<Vec<MessageRecord>>;

    /// Commit a message and notify `recipients`.
    async fn submit_message(
        &self,
        conversation: &ConversationId,
        entry: MessageEntry,
        recipients: &[AgentKey],
    ) -> anyhow::Result<Confirmation>;

    async fn upload_attachment(&self, bytes: Bytes) -> anyhow::Result<EntryHandle>;

    async fn download_attachment(&self, handle: &EntryHandle) -> anyhow::Result<Bytes>;

    /// Participants of the conversation and their profiles.
    async fn fetch_roster(
        &self,
        conversation: &ConversationId,
    ) -> anyhow::Result<HashMap<AgentKey, Profile>>;
}

/// Run one backend call under `limit`, mapping both failure kinds to
/// [`SyncError`].
pub async fn call_with_timeout<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, SyncError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(SyncError::backend(operation, e)),
        Err(_) => Err(SyncError::Timeout {
            operation,
            after: limit,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_passes_through() {
        let value = call_with_timeout("probe", Duration::from_secs(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_backend_error_is_mapped() {
        let err = call_with_timeout::<(), _>("probe", Duration::from_secs(1), async {
            Err(anyhow::anyhow!("zome call failed"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Backend { operation: "probe", .. }));
        assert!(err.to_string().contains("zome call failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out() {
        let err = call_with_timeout::<(), _>("probe", Duration::from_secs(30), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Timeout { .. }));
    }
}
