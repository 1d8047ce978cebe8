//! Time bucketing of a conversation's timeline.
//!
//! A bucket is a fixed-width slice of time counted from the moment the
//! conversation was created. Bucket `n` covers timestamps whose distance from
//! creation rounds to `n * range`.

use chrono::{DateTime, Utc};

/// Maps timestamps to bucket numbers for one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketClock {
    created_at: DateTime<Utc>,
    range_ms: u64,
}

impl BucketClock {
    /// # Panics
    ///
    /// Panics if `range_ms` is zero.
    pub fn new(created_at: DateTime<Utc>, range_ms: u64) -> Self {
        assert!(range_ms > 0, "bucket range must be non-zero");
        Self {
            created_at,
            range_ms,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn range_ms(&self) -> u64 {
        self.range_ms
    }

    /// `round((at - created) / range)`.
    ///
    /// Timestamps earlier than the conversation's creation (peer clock skew)
    /// land in bucket 0.
    pub fn bucket_for(&self, at: DateTime<Utc>) -> u32 {
        let elapsed = (at - self.created_at).num_milliseconds();
        if elapsed <= 0 {
            return 0;
        }
        let elapsed = elapsed as u64;
        let bucket = (elapsed + self.range_ms / 2) / self.range_ms;
        u32::try_from(bucket).unwrap_or(u32::MAX)
    }

    pub fn current_bucket(&self) -> u32 {
        self.bucket_for(Utc::now())
    }
}
