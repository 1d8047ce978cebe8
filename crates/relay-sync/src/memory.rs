//! In-process [`Backend`] for tests and offline development.
//!
//! Entries and blobs are content addressed with BLAKE3. Replication lag is
//! simulated by capping how many entries one fetch may return, and every
//! call can be made to fail on demand.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use relay_shared::protocol::{Confirmation, MessageEntry, MessageRecord, Profile};
use relay_shared::{AgentKey, ConversationId, EntryHandle, MessageHash};

use crate::backend::Backend;

#[derive(Default)]
struct ConversationLog {
    buckets: BTreeMap<u32, Vec<MessageHash>>,
    records: HashMap<MessageHash, MessageRecord>,
}

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, ConversationLog>,
    rosters: HashMap<ConversationId, HashMap<AgentKey, Profile>>,
    blobs: HashMap<EntryHandle, Bytes>,
    replication_limit: Option<usize>,
    failing_buckets: HashSet<u32>,
    failing_submits: u32,
    failing_downloads: HashMap<EntryHandle, u32>,
    failing_uploads: HashSet<EntryHandle>,
    uploads: Vec<EntryHandle>,
    submit_delay: Option<Duration>,
    requested_entries: Vec<Vec<MessageHash>>,
    hash_fetches: Vec<(ConversationId, u32)>,
    submissions: Vec<(MessageEntry, Vec<AgentKey>)>,
    download_attempts: HashMap<EntryHandle, u32>,
    submit_time: Option<DateTime<Utc>>,
}

/// Backend that keeps everything in memory.
pub struct MemoryBackend {
    /// Author recorded on submitted messages.
    author: AgentKey,
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new(author: AgentKey) -> Self {
        Self {
            author,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn state(&self) -> anyhow::Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory backend lock poisoned"))
    }

    /// Commit `entry` as `author` at `at`, as if another client sent it.
    pub fn publish(
        &self,
        conversation: &ConversationId,
        author: AgentKey,
        entry: &MessageEntry,
        at: DateTime<Utc>,
    ) -> anyhow::Result<MessageRecord> {
        let hash = entry_hash(&author, at, entry)?;
        let record = MessageRecord::new(hash, author, at, entry)?;
        self.insert_record(conversation, entry.bucket, record.clone())?;
        Ok(record)
    }

    /// Store a record verbatim, even one whose entry will not decode.
    pub fn insert_record(
        &self,
        conversation: &ConversationId,
        bucket: u32,
        record: MessageRecord,
    ) -> anyhow::Result<()> {
        let mut state = self.state()?;
        let log = state.conversations.entry(conversation.clone()).or_default();
        let hashes = log.buckets.entry(bucket).or_default();
        if !hashes.contains(&record.hash) {
            hashes.push(record.hash.clone());
        }
        log.records.insert(record.hash.clone(), record);
        Ok(())
    }

    pub fn set_roster(
        &self,
        conversation: &ConversationId,
        roster: HashMap<AgentKey, Profile>,
    ) -> anyhow::Result<()> {
        self.state()?.rosters.insert(conversation.clone(), roster);
        Ok(())
    }

    pub fn put_blob(&self, bytes: Bytes) -> anyhow::Result<EntryHandle> {
        let handle = blob_handle(&bytes);
        self.state()?.blobs.insert(handle.clone(), bytes);
        Ok(handle)
    }

    /// Cap the number of entries one `fetch_messages` call returns.
    pub fn set_replication_limit(&self, limit: Option<usize>) -> anyhow::Result<()> {
        self.state()?.replication_limit = limit;
        Ok(())
    }

    /// Make hash listing fail for `bucket` until cleared.
    pub fn set_bucket_failing(&self, bucket: u32, failing: bool) -> anyhow::Result<()> {
        let mut state = self.state()?;
        if failing {
            state.failing_buckets.insert(bucket);
        } else {
            state.failing_buckets.remove(&bucket);
        }
        Ok(())
    }

    /// Fail the next `count` submits.
    pub fn fail_next_submits(&self, count: u32) -> anyhow::Result<()> {
        self.state()?.failing_submits = count;
        Ok(())
    }

    /// Fail the next `count` downloads of `handle`.
    pub fn fail_downloads(&self, handle: &EntryHandle, count: u32) -> anyhow::Result<()> {
        self.state()?.failing_downloads.insert(handle.clone(), count);
        Ok(())
    }

    /// Reject uploads of exactly `bytes` until cleared.
    pub fn set_upload_failing(&self, bytes: &[u8], failing: bool) -> anyhow::Result<()> {
        let handle = blob_handle(bytes);
        let mut state = self.state()?;
        if failing {
            state.failing_uploads.insert(handle);
        } else {
            state.failing_uploads.remove(&handle);
        }
        Ok(())
    }

    /// Hold every submit for `delay` after it has been committed, so the
    /// caller can time out on a message that did land.
    pub fn set_submit_delay(&self, delay: Option<Duration>) -> anyhow::Result<()> {
        self.state()?.submit_delay = delay;
        Ok(())
    }

    /// Timestamp given to submitted messages instead of the wall clock.
    pub fn set_submit_time(&self, at: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        self.state()?.submit_time = at;
        Ok(())
    }

    /// Hash lists passed to each `fetch_messages` call, in call order.
    pub fn requested_entries(&self) -> Vec<Vec<MessageHash>> {
        self.state()
            .map(|s| s.requested_entries.clone())
            .unwrap_or_default()
    }

    pub fn hash_fetches(&self) -> Vec<(ConversationId, u32)> {
        self.state()
            .map(|s| s.hash_fetches.clone())
            .unwrap_or_default()
    }

    pub fn submissions(&self) -> Vec<(MessageEntry, Vec<AgentKey>)> {
        self.state()
            .map(|s| s.submissions.clone())
            .unwrap_or_default()
    }

    /// Handles of accepted uploads, in call order.
    pub fn uploads(&self) -> Vec<EntryHandle> {
        self.state().map(|s| s.uploads.clone()).unwrap_or_default()
    }

    pub fn download_attempts(&self, handle: &EntryHandle) -> u32 {
        self.state()
            .map(|s| s.download_attempts.get(handle).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn fetch_message_hashes(
        &self,
        conversation: &ConversationId,
        bucket: u32,
        _known_count: usize,
    ) -> anyhow::Result<Vec<MessageHash>> {
        let mut state = self.state()?;
        state.hash_fetches.push((conversation.clone(), bucket));
        if state.failing_buckets.contains(&bucket) {
            bail!("bucket {bucket} unavailable");
        }
        Ok(state
            .conversations
            .get(conversation)
            .and_then(|log| log.buckets.get(&bucket))
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_messages(
        &self,
        conversation: &ConversationId,
        hashes: &[MessageHash],
    ) -> anyhow::Result<Vec<MessageRecord>> {
        let mut state = self.state()?;
        state.requested_entries.push(hashes.to_vec());
        let limit = state.replication_limit.unwrap_or(usize::MAX);
        let Some(log) = state.conversations.get(conversation) else {
            return Ok(Vec::new());
        };
        Ok(hashes
            .iter()
            .filter_map(|hash| log.records.get(hash).cloned())
            .take(limit)
            .collect())
    }

    async fn submit_message(
        &self,
        conversation: &ConversationId,
        entry: MessageEntry,
        recipients: &[AgentKey],
    ) -> anyhow::Result<Confirmation> {
        let (at, delay) = {
            let mut state = self.state()?;
            if state.failing_submits > 0 {
                state.failing_submits -= 1;
                bail!("submit rejected");
            }
            state.submissions.push((entry.clone(), recipients.to_vec()));
            (state.submit_time.unwrap_or_else(Utc::now), state.submit_delay)
        };

        let record = self.publish(conversation, self.author.clone(), &entry, at)?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Confirmation {
            hash: record.hash,
            timestamp: at,
        })
    }

    async fn upload_attachment(&self, bytes: Bytes) -> anyhow::Result<EntryHandle> {
        let handle = blob_handle(&bytes);
        let mut state = self.state()?;
        if state.failing_uploads.contains(&handle) {
            bail!("upload of {handle} rejected");
        }
        state.uploads.push(handle.clone());
        state.blobs.insert(handle.clone(), bytes);
        Ok(handle)
    }

    async fn download_attachment(&self, handle: &EntryHandle) -> anyhow::Result<Bytes> {
        let mut state = self.state()?;
        *state.download_attempts.entry(handle.clone()).or_default() += 1;
        if let Some(remaining) = state.failing_downloads.get_mut(handle) {
            if *remaining > 0 {
                *remaining -= 1;
                bail!("blob {handle} not replicated yet");
            }
        }
        state
            .blobs
            .get(handle)
            .cloned()
            .ok_or_else(|| anyhow!("blob {handle} not found"))
    }

    async fn fetch_roster(
        &self,
        conversation: &ConversationId,
    ) -> anyhow::Result<HashMap<AgentKey, Profile>> {
        Ok(self
            .state()?
            .rosters
            .get(conversation)
            .cloned()
            .unwrap_or_default())
    }
}

/// Hash of the action committing `entry`.
fn entry_hash(author: &AgentKey, at: DateTime<Utc>, entry: &MessageEntry) -> anyhow::Result<MessageHash> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(author.as_str().as_bytes());
    hasher.update(&at.timestamp_micros().to_le_bytes());
    hasher.update(&serde_json::to_vec(entry)?);
    Ok(MessageHash::new(format!("uhCkk{}", hex::encode(hasher.finalize().as_bytes()))))
}

fn blob_handle(bytes: &[u8]) -> EntryHandle {
    EntryHandle::new(format!("uhCEk{}", hex::encode(blake3::hash(bytes).as_bytes())))
}
