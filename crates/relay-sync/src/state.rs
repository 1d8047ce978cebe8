//! Mutable state owned by one conversation engine.
//!
//! [`EngineState`] lives behind the engine's async mutex; every method here
//! assumes the lock is held and never awaits.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use relay_shared::protocol::Profile;
use relay_shared::{AgentKey, ConversationId, MessageHash};
use relay_store::HistoryIndex;

use crate::models::{chronological, Message, OutgoingImage};

/// Lifecycle of a conversation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Uninitialized,
    Initializing,
    Idle,
    Loading,
}

pub(crate) struct EngineState {
    pub history: HistoryIndex,

    /// Every message materialised so far, pending ones included.
    pub messages: HashMap<MessageHash, Message>,

    pub agent_profiles: HashMap<AgentKey, Profile>,

    /// Newest message by timestamp.
    pub last_message: Option<Message>,

    pub unread: bool,

    /// Lowest bucket covered by page loads; `None` before the first page.
    pub oldest_bucket_loaded: Option<u32>,

    pub sync_state: SyncState,

    /// Bytes of images attached to unconfirmed sends, kept for retries.
    pub outbox: HashMap<MessageHash, Vec<OutgoingImage>>,
}

impl EngineState {
    pub fn new(history: HistoryIndex) -> Self {
        Self {
            history,
            messages: HashMap::new(),
            agent_profiles: HashMap::new(),
            last_message: None,
            unread: false,
            oldest_bucket_loaded: None,
            sync_state: SyncState::Uninitialized,
            outbox: HashMap::new(),
        }
    }

    pub fn sorted_messages(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.messages.values().cloned().collect();
        messages.sort_by(chronological);
        messages
    }

    /// Point `last_message` at the newest message in the map. Returns the
    /// new value when it changed.
    pub fn refresh_last_message(&mut self) -> Option<Message> {
        let newest = self
            .messages
            .values()
            .max_by(|a, b| chronological(a, b))
            .cloned();
        if newest == self.last_message {
            return None;
        }
        self.last_message = newest;
        self.last_message.clone()
    }

    /// Move the cursor down to `bucket` unless older pages are already loaded.
    pub fn cover_down_to(&mut self, bucket: u32) {
        self.oldest_bucket_loaded = Some(match self.oldest_bucket_loaded {
            Some(existing) => existing.min(bucket),
            None => bucket,
        });
    }
}

/// Point-in-time copy of an engine's observable state.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSnapshot {
    pub conversation_id: ConversationId,
    pub state: SyncState,
    pub messages: Vec<Message>,
    pub agent_profiles: HashMap<AgentKey, Profile>,
    pub last_message: Option<Message>,
    pub unread: bool,
    pub oldest_bucket_loaded: Option<u32>,
    /// Timestamp used to order conversations: last message, else creation.
    pub activity_at: DateTime<Utc>,
}

impl ConversationSnapshot {
    pub(crate) fn capture(
        conversation_id: ConversationId,
        created_at: DateTime<Utc>,
        state: &EngineState,
    ) -> Self {
        Self {
            conversation_id,
            state: state.sync_state,
            messages: state.sorted_messages(),
            agent_profiles: state.agent_profiles.clone(),
            last_message: state.last_message.clone(),
            unread: state.unread,
            oldest_bucket_loaded: state.oldest_bucket_loaded,
            activity_at: state
                .last_message
                .as_ref()
                .map(|m| m.timestamp)
                .unwrap_or(created_at),
        }
    }
}
