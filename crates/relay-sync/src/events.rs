//! Change notifications published by the engine.
//!
//! Observers (a UI, the conversation list, notification code) subscribe to a
//! [`tokio::sync::broadcast`] channel. A slow observer that lags only loses
//! intermediate snapshots; the next `MessagesUpdated` carries the full state.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use relay_shared::ConversationId;

use crate::models::Message;
use crate::state::SyncState;

pub const EVENT_MESSAGES_UPDATED: &str = "messages-updated";
pub const EVENT_MESSAGE_UPDATED: &str = "message-updated";
pub const EVENT_LAST_MESSAGE_CHANGED: &str = "last-message-changed";
pub const EVENT_UNREAD_CHANGED: &str = "unread-changed";
pub const EVENT_STATE_CHANGED: &str = "state-changed";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Full snapshot of the message map, oldest first.
    MessagesUpdated {
        conversation_id: ConversationId,
        messages: Arc<Vec<Message>>,
    },
    /// One message changed in place (image loaded, send failed).
    MessageUpdated {
        conversation_id: ConversationId,
        message: Message,
    },
    LastMessageChanged {
        conversation_id: ConversationId,
        message: Message,
    },
    UnreadChanged {
        conversation_id: ConversationId,
        unread: bool,
    },
    StateChanged {
        conversation_id: ConversationId,
        state: SyncState,
    },
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessagesUpdated { .. } => EVENT_MESSAGES_UPDATED,
            Self::MessageUpdated { .. } => EVENT_MESSAGE_UPDATED,
            Self::LastMessageChanged { .. } => EVENT_LAST_MESSAGE_CHANGED,
            Self::UnreadChanged { .. } => EVENT_UNREAD_CHANGED,
            Self::StateChanged { .. } => EVENT_STATE_CHANGED,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::MessagesUpdated { conversation_id, .. }
            | Self::MessageUpdated { conversation_id, .. }
            | Self::LastMessageChanged { conversation_id, .. }
            | Self::UnreadChanged { conversation_id, .. }
            | Self::StateChanged { conversation_id, .. } => conversation_id,
        }
    }
}

/// Sending half of the engine's event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        let name = event.name();
        // Having nobody listening is normal before a view is opened.
        if self.tx.send(event).is_err() {
            tracing::trace!(event = name, "no subscribers for event");
        }
    }
}
