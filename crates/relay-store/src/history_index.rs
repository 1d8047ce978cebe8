//! Per-conversation index of history buckets.
//!
//! Buckets are materialised lazily: the first reference to a bucket number
//! loads its persisted record (or starts empty). Every mutation writes the
//! touched bucket back immediately under
//! `conversation.<conversation id>.bucket.<bucket number>`.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use relay_shared::{ConversationId, MessageHash};

use crate::bucket_index::BucketIndex;
use crate::error::Result;
use crate::kv::KvStore;

/// Ordered bucket indexes for one conversation.
pub struct HistoryIndex {
    conversation_id: ConversationId,
    store: Arc<dyn KvStore>,
    buckets: BTreeMap<u32, BucketIndex>,
    current_bucket: u32,
}

impl HistoryIndex {
    pub fn new(conversation_id: ConversationId, current_bucket: u32, store: Arc<dyn KvStore>) -> Self {
        Self {
            conversation_id,
            store,
            buckets: BTreeMap::new(),
            current_bucket,
        }
    }

    /// Storage key of one bucket record.
    pub fn storage_key(conversation_id: &ConversationId, bucket: u32) -> String {
        format!("{}.bucket.{}", conversation_id.storage_prefix(), bucket)
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn current_bucket(&self) -> u32 {
        self.current_bucket
    }

    /// Move the "now" bucket forward as time passes. Never moves backward.
    pub fn advance_to(&mut self, bucket: u32) {
        self.current_bucket = self.current_bucket.max(bucket);
    }

    /// Bucket `i`, loaded from storage or created empty on first use.
    pub fn get_bucket(&mut self, i: u32) -> &mut BucketIndex {
        if !self.buckets.contains_key(&i) {
            let loaded = self.load_bucket(i);
            self.buckets.insert(i, loaded);
        }
        self.buckets.entry(i).or_default()
    }

    fn load_bucket(&self, i: u32) -> BucketIndex {
        let key = Self::storage_key(&self.conversation_id, i);
        match self.store.get(&key) {
            Ok(Some(raw)) => BucketIndex::from_stored(&raw),
            Ok(None) => BucketIndex::empty(),
            Err(e) => {
                warn!(key = %key, error = %e, "failed to read bucket record, starting empty");
                BucketIndex::empty()
            }
        }
    }

    /// Bucket numbers to visit, newest first, so that their combined count
    /// reaches `target_count`.
    ///
    /// Always contains `starting_bucket`. Walks down until the running total
    /// reaches the target or bucket 0 has been visited. The bucket that
    /// crosses the threshold is included whole.
    pub fn buckets_for_set(&mut self, target_count: usize, starting_bucket: u32) -> Vec<u32> {
        let mut selected = Vec::new();
        let mut total = 0;
        for i in (0..=starting_bucket).rev() {
            selected.push(i);
            total += self.get_bucket(i).count();
            if total >= target_count {
                break;
            }
        }
        selected
    }

    /// Record `hash` as a member of `bucket` and persist the bucket.
    pub fn add(&mut self, bucket: u32, hash: MessageHash) -> bool {
        self.add_all(bucket, std::iter::once(hash))
    }

    /// Record several hashes in one bucket with a single write.
    pub fn add_all<I>(&mut self, bucket: u32, hashes: I) -> bool
    where
        I: IntoIterator<Item = MessageHash>,
    {
        let changed = self.get_bucket(bucket).add(hashes);
        if let Err(e) = self.save_bucket(bucket) {
            warn!(
                conversation = %self.conversation_id,
                bucket,
                error = %e,
                "failed to persist bucket"
            );
        }
        changed
    }

    /// Write bucket `i` to storage.
    pub fn save_bucket(&mut self, i: u32) -> Result<()> {
        let json = self.get_bucket(i).to_json()?;
        let key = Self::storage_key(&self.conversation_id, i);
        self.store.set(&key, &json)?;
        debug!(key = %key, "saved bucket");
        Ok(())
    }

    /// Total messages across all buckets materialised so far.
    pub fn message_count(&self) -> usize {
        self.buckets.values().map(BucketIndex::count).sum()
    }
}
