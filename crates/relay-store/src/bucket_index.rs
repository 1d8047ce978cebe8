//! Local knowledge of which messages belong to one history bucket.
//!
//! A bucket is known either by its full set of message hashes or, for data
//! inherited from count-only seeds, by its cardinality alone. Count mode
//! cannot answer membership questions; callers that need them upgrade the
//! bucket with [`BucketIndex::ensure_hash_type`] first.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use relay_shared::MessageHash;

/// Membership knowledge for one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketIndex {
    /// Only the number of messages is known.
    Count(usize),
    /// The hashes of every message known to be in the bucket.
    Hashes(BTreeSet<MessageHash>),
}

/// Persisted shape of a bucket: `{"mode": "count"|"hashes", "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "payload", rename_all = "lowercase")]
pub enum BucketRecord {
    Count(usize),
    Hashes(Vec<MessageHash>),
}

/// Everything a stored bucket may look like, including the untagged forms
/// written by older clients (a bare count or a bare array of hashes).
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredBucket {
    Tagged(BucketRecord),
    LegacyCount(usize),
    LegacyHashes(Vec<MessageHash>),
}

impl Default for BucketIndex {
    fn default() -> Self {
        Self::Hashes(BTreeSet::new())
    }
}

impl BucketIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_hashes(hashes: impl IntoIterator<Item = MessageHash>) -> Self {
        Self::Hashes(hashes.into_iter().collect())
    }

    pub fn count(&self) -> usize {
        match self {
            Self::Count(n) => *n,
            Self::Hashes(set) => set.len(),
        }
    }

    pub fn is_hash_type(&self) -> bool {
        matches!(self, Self::Hashes(_))
    }

    /// Merge `hashes` into the bucket and report whether the count changed.
    ///
    /// An empty count-mode bucket becomes a hash-set. A non-empty count-mode
    /// bucket stays in count mode and grows by the number of hashes given,
    /// since it cannot tell which of them it already knows.
    pub fn add<I>(&mut self, hashes: I) -> bool
    where
        I: IntoIterator<Item = MessageHash>,
    {
        let before = self.count();
        match self {
            Self::Count(0) => *self = Self::from_hashes(hashes),
            Self::Count(n) => *n += hashes.into_iter().count(),
            Self::Hashes(set) => set.extend(hashes),
        }
        before != self.count()
    }

    /// `candidates - known`, in candidate order and without duplicates.
    ///
    /// A count-mode bucket knows no hashes, so every candidate is returned.
    pub fn missing(&self, candidates: &[MessageHash]) -> Vec<MessageHash> {
        let mut seen = BTreeSet::new();
        candidates
            .iter()
            .filter(|hash| match self {
                Self::Count(_) => true,
                Self::Hashes(set) => !set.contains(*hash),
            })
            .filter(|hash| seen.insert((*hash).clone()))
            .cloned()
            .collect()
    }

    /// Switch a count-mode bucket to an empty hash-set.
    ///
    /// The count is discarded, not migrated: the hashes behind it are unknown.
    pub fn ensure_hash_type(&mut self) {
        if let Self::Count(_) = self {
            *self = Self::empty();
        }
    }

    pub fn contains(&self, hash: &MessageHash) -> bool {
        match self {
            Self::Count(_) => false,
            Self::Hashes(set) => set.contains(hash),
        }
    }

    pub fn to_record(&self) -> BucketRecord {
        match self {
            Self::Count(n) => BucketRecord::Count(*n),
            Self::Hashes(set) => BucketRecord::Hashes(set.iter().cloned().collect()),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.to_record())
    }

    /// Strict parse of a stored record.
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        let stored: StoredBucket = serde_json::from_str(raw)?;
        Ok(match stored {
            StoredBucket::Tagged(BucketRecord::Count(n)) | StoredBucket::LegacyCount(n) => {
                Self::Count(n)
            }
            StoredBucket::Tagged(BucketRecord::Hashes(hashes))
            | StoredBucket::LegacyHashes(hashes) => Self::from_hashes(hashes),
        })
    }

    /// Lenient parse: malformed records are logged and replaced by an empty
    /// hash-set.
    pub fn from_stored(raw: &str) -> Self {
        match Self::parse(raw) {
            Ok(bucket) => bucket,
            Err(e) => {
                tracing::warn!(error = %e, record = raw, "badly formed bucket record, starting empty");
                Self::empty()
            }
        }
    }
}

impl From<BucketRecord> for BucketIndex {
    fn from(record: BucketRecord) -> Self {
        match record {
            BucketRecord::Count(n) => Self::Count(n),
            BucketRecord::Hashes(hashes) => Self::from_hashes(hashes),
        }
    }
}
