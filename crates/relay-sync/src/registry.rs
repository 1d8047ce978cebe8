//! Every conversation the user takes part in.
//!
//! The registry owns one engine per conversation, routes realtime pushes to
//! the right engine, tracks which conversation is focused, and orders the
//! conversation list by recent activity.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock as AsyncRwLock};
use tracing::{debug, info, warn};

use relay_shared::protocol::RealtimeEvent;
use relay_shared::ConversationId;
use relay_store::KvStore;

use crate::backend::Backend;
use crate::config::SyncConfig;
use crate::engine::{ConversationSettings, ConversationSyncEngine, FocusPredicate};
use crate::models::Message;

pub struct ConversationRegistry {
    config: SyncConfig,
    backend: Arc<dyn Backend>,
    store: Arc<dyn KvStore>,
    engines: AsyncRwLock<HashMap<ConversationId, ConversationSyncEngine>>,
    /// Read synchronously by every engine's focus predicate.
    focused: Arc<RwLock<Option<ConversationId>>>,
}

impl ConversationRegistry {
    pub fn new(config: SyncConfig, backend: Arc<dyn Backend>, store: Arc<dyn KvStore>) -> Self {
        Self {
            config,
            backend,
            store,
            engines: AsyncRwLock::new(HashMap::new()),
            focused: Arc::new(RwLock::new(None)),
        }
    }

    /// Register and initialise a conversation. Registering an id twice
    /// returns the existing engine.
    pub async fn add_conversation(&self, settings: ConversationSettings) -> ConversationSyncEngine {
        let engine = {
            let mut engines = self.engines.write().await;
            if let Some(existing) = engines.get(&settings.id) {
                return existing.clone();
            }
            let engine = ConversationSyncEngine::new(
                settings.clone(),
                self.config.clone(),
                self.backend.clone(),
                self.store.clone(),
                self.focus_predicate(),
            );
            engines.insert(settings.id.clone(), engine.clone());
            engine
        };

        info!(conversation = %settings.id, "conversation registered");
        engine.initialize().await;
        engine
    }

    pub async fn get(&self, id: &ConversationId) -> Option<ConversationSyncEngine> {
        self.engines.read().await.get(id).cloned()
    }

    pub async fn conversation_ids(&self) -> Vec<ConversationId> {
        self.engines.read().await.keys().cloned().collect()
    }

    /// Focus a conversation (or none). Focusing clears its unread flag.
    pub async fn focus(&self, id: Option<ConversationId>) {
        match self.focused.write() {
            Ok(mut focused) => *focused = id.clone(),
            Err(e) => {
                warn!(error = %e, "focus lock poisoned");
                return;
            }
        }

        if let Some(id) = id {
            if let Some(engine) = self.get(&id).await {
                engine.mark_read().await;
            }
        }
    }

    pub fn focused(&self) -> Option<ConversationId> {
        self.focused.read().ok().and_then(|focused| focused.clone())
    }

    /// Hand a realtime push to the engine of its conversation.
    pub async fn handle_realtime(&self, event: RealtimeEvent) -> Option<Message> {
        let Some(engine) = self.get(&event.conversation_id).await else {
            warn!(conversation = %event.conversation_id, "realtime event for unknown conversation");
            return None;
        };
        engine.handle_realtime(event).await
    }

    /// Forward pushes from the backend's signal stream until it closes.
    pub async fn run_realtime(self: Arc<Self>, mut rx: mpsc::Receiver<RealtimeEvent>) {
        debug!("realtime loop started");
        while let Some(event) = rx.recv().await {
            self.handle_realtime(event).await;
        }
        debug!("realtime channel closed, loop exiting");
    }

    /// Conversations with their activity time, most recent first.
    pub async fn conversations_by_activity(&self) -> Vec<(ConversationId, DateTime<Utc>)> {
        let engines: Vec<ConversationSyncEngine> =
            self.engines.read().await.values().cloned().collect();

        let mut ordered = Vec::with_capacity(engines.len());
        for engine in engines {
            ordered.push((engine.conversation_id().clone(), engine.activity_at().await));
        }
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ordered
    }

    fn focus_predicate(&self) -> FocusPredicate {
        let focused = self.focused.clone();
        Arc::new(move |id: &ConversationId| {
            focused
                .read()
                .map(|focused| focused.as_ref() == Some(id))
                .unwrap_or(false)
        })
    }
}
