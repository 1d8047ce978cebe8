// Shared fixtures for the relay-sync integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast;

use relay_shared::protocol::{FileDescriptor, MessageEntry, MessageRecord, Profile};
use relay_shared::{AgentKey, ConversationId, MessageHash};
use relay_store::{KvStore, MemoryKvStore};
use relay_sync::memory::MemoryBackend;
use relay_sync::{ConversationSettings, ConversationSyncEngine, SyncConfig, SyncEvent};

pub const ME: &str = "uhCAkMe";
pub const BOB: &str = "uhCAkBob";

/// Conversations in these tests were created five days ago, so "now" is
/// bucket 5 with the default one-day range.
pub const CURRENT_BUCKET: u32 = 5;

pub fn conversation() -> ConversationId {
    ConversationId::new("uhC0kConversation")
}

pub fn created_at() -> DateTime<Utc> {
    Utc::now() - Duration::days(CURRENT_BUCKET as i64)
}

/// Midday of `bucket`, well inside its rounding window.
pub fn time_in_bucket(created: DateTime<Utc>, bucket: u32) -> DateTime<Utc> {
    created + Duration::days(bucket as i64) - Duration::hours(1)
}

pub fn entry(content: &str, bucket: u32) -> MessageEntry {
    MessageEntry {
        content: content.to_string(),
        bucket,
        images: vec![],
        correlation_id: None,
    }
}

pub fn entry_with_image(content: &str, bucket: u32, image: FileDescriptor) -> MessageEntry {
    MessageEntry {
        images: vec![image],
        ..entry(content, bucket)
    }
}

pub fn roster() -> HashMap<AgentKey, Profile> {
    let profile = |first: &str| Profile {
        first_name: first.to_string(),
        last_name: "Test".to_string(),
        avatar: None,
    };
    HashMap::from([
        (AgentKey::from(ME), profile("Me")),
        (AgentKey::from(BOB), profile("Bob")),
    ])
}

/// Engine plus the pieces tests poke at directly.
pub struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub store: Arc<MemoryKvStore>,
    pub focused: Arc<AtomicBool>,
    pub created_at: DateTime<Utc>,
    pub engine: ConversationSyncEngine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        let backend = Arc::new(MemoryBackend::new(AgentKey::from(ME)));
        backend.set_roster(&conversation(), roster()).unwrap();
        Self::sharing(backend, Arc::new(MemoryKvStore::new()), created_at(), config)
    }

    /// Another engine over an existing backend and store, like a restart.
    pub fn sharing(
        backend: Arc<MemoryBackend>,
        store: Arc<MemoryKvStore>,
        created_at: DateTime<Utc>,
        config: SyncConfig,
    ) -> Self {
        let focused = Arc::new(AtomicBool::new(false));
        let flag = focused.clone();
        let engine = ConversationSyncEngine::new(
            ConversationSettings {
                id: conversation(),
                created_at,
            },
            config,
            backend.clone(),
            store.clone() as Arc<dyn KvStore>,
            Arc::new(move |_: &ConversationId| flag.load(Ordering::SeqCst)),
        );
        Self {
            backend,
            store,
            focused,
            created_at,
            engine,
        }
    }

    pub fn set_focused(&self, focused: bool) {
        self.focused.store(focused, Ordering::SeqCst);
    }

    /// Commit a message from Bob in `bucket`.
    pub fn bob_says(&self, content: &str, bucket: u32) -> MessageRecord {
        self.backend
            .publish(
                &conversation(),
                AgentKey::from(BOB),
                &entry(content, bucket),
                time_in_bucket(self.created_at, bucket),
            )
            .unwrap()
    }

    /// `per_bucket` messages from Bob in every bucket up to the current one.
    pub fn seed(&self, per_bucket: usize) -> Vec<MessageHash> {
        let mut hashes = Vec::new();
        for bucket in 0..=CURRENT_BUCKET {
            for n in 0..per_bucket {
                hashes.push(self.bob_says(&format!("b{bucket}-m{n}"), bucket).hash);
            }
        }
        hashes
    }
}

/// Everything already buffered on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn count_messages_updated(events: &[SyncEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SyncEvent::MessagesUpdated { .. }))
        .count()
}
