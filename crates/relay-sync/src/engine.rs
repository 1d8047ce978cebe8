//! Per-conversation history synchronisation.
//!
//! A [`ConversationSyncEngine`] keeps the local message map of one
//! conversation consistent with the replication backend. Time is split into
//! buckets ([`BucketClock`]); the engine remembers which hashes each bucket
//! holds ([`HistoryIndex`]), asks the backend for the authoritative list,
//! and fetches only what it has not materialised yet.
//!
//! The engine is a cheap handle around shared state. Engine state sits behind
//! one async mutex that is never held across a backend call, so bucket loads
//! for different buckets overlap freely. Page loads are serialised by a
//! second mutex because each one moves the paging cursor.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use relay_shared::constants::EVENT_CHANNEL_CAPACITY;
use relay_shared::protocol::{MessageEntry, Profile, RealtimeEvent};
use relay_shared::{AgentKey, BucketClock, ConversationId, CorrelationId, EntryHandle, MessageHash};
use relay_store::{HistoryIndex, KvStore};

use crate::attachments::{data_url, download_with_retry, RetryPolicy};
use crate::backend::{call_with_timeout, Backend};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::models::{Image, ImageStatus, Message, MessageStatus, OutgoingImage};
use crate::reconcile::{merge_confirmed, Merge};
use crate::state::{ConversationSnapshot, EngineState, SyncState};

/// Answers whether the user is looking at a conversation right now.
pub type FocusPredicate = Arc<dyn Fn(&ConversationId) -> bool + Send + Sync>;

/// Identity of the conversation an engine serves.
#[derive(Debug, Clone)]
pub struct ConversationSettings {
    pub id: ConversationId,
    /// Creation time; bucket 0 starts here.
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ConversationSyncEngine {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConversationId,
    clock: BucketClock,
    config: SyncConfig,
    retry: RetryPolicy,
    backend: Arc<dyn Backend>,
    state: Mutex<EngineState>,
    page_lock: Mutex<()>,
    events: EventBus,
    is_focused: FocusPredicate,
}

impl ConversationSyncEngine {
    /// Build an engine. Nothing is fetched until [`initialize`](Self::initialize).
    ///
    /// # Panics
    ///
    /// If `config.bucket_range_ms` is zero.
    pub fn new(
        settings: ConversationSettings,
        config: SyncConfig,
        backend: Arc<dyn Backend>,
        store: Arc<dyn KvStore>,
        is_focused: FocusPredicate,
    ) -> Self {
        let clock = BucketClock::new(settings.created_at, config.bucket_range_ms);
        let history = HistoryIndex::new(settings.id.clone(), clock.current_bucket(), store);

        Self {
            inner: Arc::new(Inner {
                id: settings.id,
                clock,
                retry: RetryPolicy::from_config(&config),
                config,
                backend,
                state: Mutex::new(EngineState::new(history)),
                page_lock: Mutex::new(()),
                events: EventBus::new(EVENT_CHANNEL_CAPACITY),
                is_focused,
            }),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.inner.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.clock.created_at()
    }

    pub fn bucket_clock(&self) -> &BucketClock {
        &self.inner.clock
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub async fn snapshot(&self) -> ConversationSnapshot {
        let state = self.inner.state.lock().await;
        ConversationSnapshot::capture(self.inner.id.clone(), self.created_at(), &state)
    }

    /// All messages, oldest first.
    pub async fn messages(&self) -> Vec<Message> {
        self.inner.state.lock().await.sorted_messages()
    }

    pub async fn message(&self, hash: &MessageHash) -> Option<Message> {
        self.inner.state.lock().await.messages.get(hash).cloned()
    }

    pub async fn last_message(&self) -> Option<Message> {
        self.inner.state.lock().await.last_message.clone()
    }

    pub async fn unread(&self) -> bool {
        self.inner.state.lock().await.unread
    }

    pub async fn sync_state(&self) -> SyncState {
        self.inner.state.lock().await.sync_state
    }

    pub async fn oldest_bucket_loaded(&self) -> Option<u32> {
        self.inner.state.lock().await.oldest_bucket_loaded
    }

    pub async fn agent_profiles(&self) -> HashMap<AgentKey, Profile> {
        self.inner.state.lock().await.agent_profiles.clone()
    }

    /// Timestamp used to order conversations: last message, else creation.
    pub async fn activity_at(&self) -> DateTime<Utc> {
        self.inner
            .state
            .lock()
            .await
            .last_message
            .as_ref()
            .map(|m| m.timestamp)
            .unwrap_or_else(|| self.created_at())
    }

    /// Messages known in local history, across every bucket touched so far.
    pub async fn known_message_count(&self) -> usize {
        self.inner.state.lock().await.history.message_count()
    }

    pub async fn mark_read(&self) {
        let mut state = self.inner.state.lock().await;
        self.set_unread(&mut state, false);
    }

    /// Fetch the roster and the first page of history.
    ///
    /// Only the first call does anything.
    pub async fn initialize(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.sync_state != SyncState::Uninitialized {
                debug!(conversation = %self.inner.id, "already initialised");
                return;
            }
            self.set_state(&mut state, SyncState::Initializing);
        }

        let _page = self.inner.page_lock.lock().await;
        self.refresh_roster().await;
        let current = self.advance_clock().await;
        let visited = self.load_set_locked(current).await;

        let mut state = self.inner.state.lock().await;
        self.set_state(&mut state, SyncState::Idle);
        info!(
            conversation = %self.inner.id,
            buckets = visited,
            messages = state.messages.len(),
            "conversation initialised"
        );
    }

    /// Replace the participant list with the backend's.
    pub async fn refresh_roster(&self) {
        let result = call_with_timeout(
            "fetch_roster",
            self.inner.config.backend_timeout,
            self.inner.backend.fetch_roster(&self.inner.id),
        )
        .await;

        match result {
            Ok(roster) => {
                debug!(conversation = %self.inner.id, agents = roster.len(), "roster loaded");
                self.inner.state.lock().await.agent_profiles = roster;
            }
            Err(e) => warn!(conversation = %self.inner.id, error = %e, "failed to load roster"),
        }
    }

    /// Reload the page ending at the current bucket.
    ///
    /// Used when coming back to a conversation; older pages already loaded
    /// stay loaded.
    pub async fn load_messages_current_page(&self) -> usize {
        let _page = self.inner.page_lock.lock().await;
        let current = self.advance_clock().await;
        self.load_set_locked(current).await
    }

    /// Load the page just below the oldest one loaded so far.
    ///
    /// Returns the number of buckets visited; `0` once bucket 0 is covered.
    pub async fn load_messages_latest_page(&self) -> usize {
        let _page = self.inner.page_lock.lock().await;
        let oldest = self.inner.state.lock().await.oldest_bucket_loaded;
        let anchor = match oldest {
            None => self.advance_clock().await,
            Some(0) => {
                debug!(conversation = %self.inner.id, "history fully loaded");
                return 0;
            }
            Some(bucket) => bucket - 1,
        };
        self.load_set_locked(anchor).await
    }

    /// Load the page that ends at `bucket`. Returns the number of buckets
    /// visited.
    ///
    /// Fails with [`SyncError::InvalidBucket`] if `bucket` is past "now".
    pub async fn load_message_set_from(&self, bucket: u32) -> Result<usize, SyncError> {
        let _page = self.inner.page_lock.lock().await;
        let current = self.advance_clock().await;
        if bucket > current {
            return Err(SyncError::InvalidBucket { bucket, current });
        }
        Ok(self.load_set_locked(bucket).await)
    }

    /// Caller holds `page_lock`.
    async fn load_set_locked(&self, bucket: u32) -> usize {
        let buckets = {
            let mut state = self.inner.state.lock().await;
            let buckets = state
                .history
                .buckets_for_set(self.inner.config.target_messages_count, bucket);
            if state.sync_state == SyncState::Idle {
                self.set_state(&mut state, SyncState::Loading);
            }
            buckets
        };

        join_all(buckets.iter().map(|b| self.load_messages_for_bucket(*b))).await;

        let visited = buckets.len();
        let oldest = bucket.saturating_add(1).saturating_sub(visited as u32);

        let mut state = self.inner.state.lock().await;
        state.cover_down_to(oldest);
        if state.sync_state == SyncState::Loading {
            self.set_state(&mut state, SyncState::Idle);
        }
        debug!(
            conversation = %self.inner.id,
            from = bucket,
            visited,
            oldest,
            "page loaded"
        );
        visited
    }

    /// Bring one bucket up to date with the backend.
    ///
    /// Returns the messages newly materialised. Failures are logged and give
    /// an empty result; the next load retries whatever is still missing.
    pub async fn load_messages_for_bucket(&self, bucket: u32) -> Vec<Message> {
        match self.try_load_bucket(bucket).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(conversation = %self.inner.id, bucket, error = %e, "bucket load failed");
                Vec::new()
            }
        }
    }

    async fn try_load_bucket(&self, bucket: u32) -> Result<Vec<Message>, SyncError> {
        let id = &self.inner.id;
        let timeout = self.inner.config.backend_timeout;

        let known_count = {
            let mut state = self.inner.state.lock().await;
            let index = state.history.get_bucket(bucket);
            index.ensure_hash_type();
            index.count()
        };

        let authoritative = call_with_timeout(
            "fetch_message_hashes",
            timeout,
            self.inner.backend.fetch_message_hashes(id, bucket, known_count),
        )
        .await?;

        let (to_load, discovered) = {
            let mut state = self.inner.state.lock().await;
            let missing = state.history.get_bucket(bucket).missing(&authoritative);
            let discovered: HashSet<MessageHash> = missing.iter().cloned().collect();
            if !missing.is_empty() {
                debug!(conversation = %id, bucket, count = missing.len(), "new hashes in bucket");
                state.history.add_all(bucket, missing);
            }
            let mut seen = HashSet::new();
            let to_load: Vec<MessageHash> = authoritative
                .into_iter()
                .filter(|hash| !state.messages.contains_key(hash))
                .filter(|hash| seen.insert(hash.clone()))
                .collect();
            (to_load, discovered)
        };

        if to_load.is_empty() {
            return Ok(Vec::new());
        }

        let records = call_with_timeout(
            "fetch_messages",
            timeout,
            self.inner.backend.fetch_messages(id, &to_load),
        )
        .await?;

        if records.len() < to_load.len() {
            debug!(
                conversation = %id,
                bucket,
                requested = to_load.len(),
                received = records.len(),
                "partial fetch, remaining entries retried on next load"
            );
        }

        let decoded: Vec<Message> = records
            .iter()
            .filter_map(|record| match Message::from_record(record) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(conversation = %id, hash = %record.hash, error = %e, "skipping undecodable record");
                    None
                }
            })
            .collect();

        let inserted = {
            let mut state = self.inner.state.lock().await;
            let mut inserted = Vec::new();
            let mut foreign = false;
            for message in decoded {
                let hash = message.hash.clone();
                let merge = absorb(&mut state, message);
                // A replaced placeholder is our own send, never unread.
                foreign |= merge == Merge::Inserted && discovered.contains(&hash);
                if merge.changed() {
                    if let Some(stored) = state.messages.get(&hash) {
                        inserted.push(stored.clone());
                    }
                }
            }
            if foreign && !self.is_focused() {
                self.set_unread(&mut state, true);
            }
            if !inserted.is_empty() {
                self.publish_changes(&mut state);
            }
            inserted
        };

        for message in inserted.iter().filter(|m| m.has_pending_images()) {
            self.spawn_image_loads(message.hash.clone());
        }

        Ok(inserted)
    }

    /// Send a message authored by `author`.
    ///
    /// The message shows up immediately as `Pending` and is replaced by the
    /// committed copy once the backend confirms it. On failure it stays in
    /// the map as `Failed` and can be resent with [`retry_send`](Self::retry_send).
    pub async fn send_message(
        &self,
        author: AgentKey,
        content: impl Into<String>,
        images: Vec<OutgoingImage>,
    ) -> Message {
        let bucket = self.advance_clock().await;
        let pending = Message {
            hash: MessageHash::placeholder(),
            author_key: author,
            content: content.into(),
            images: images.iter().map(local_image).collect(),
            bucket,
            timestamp: Utc::now(),
            status: MessageStatus::Pending,
            correlation_id: Some(CorrelationId::new()),
        };

        {
            let mut state = self.inner.state.lock().await;
            state.messages.insert(pending.hash.clone(), pending.clone());
            if !images.is_empty() {
                state.outbox.insert(pending.hash.clone(), images);
            }
            self.publish_changes(&mut state);
        }

        let delivered = self.deliver(&pending).await;
        match delivered {
            Ok(confirmed) => confirmed,
            Err(e) => {
                warn!(conversation = %self.inner.id, placeholder = %pending.hash.short(), error = %e, "send failed");
                let failed = self.mark_failed(&pending.hash).await;
                failed.unwrap_or(Message {
                    status: MessageStatus::Failed,
                    ..pending
                })
            }
        }
    }

    /// Resend a message whose earlier send failed.
    pub async fn retry_send(&self, hash: &MessageHash) -> Result<Message, SyncError> {
        let pending = {
            let mut state = self.inner.state.lock().await;
            let message = state
                .messages
                .get_mut(hash)
                .ok_or_else(|| SyncError::UnknownMessage(hash.clone()))?;
            if message.status != MessageStatus::Failed {
                return Err(SyncError::NotRetryable(hash.clone()));
            }
            message.status = MessageStatus::Pending;
            let pending = message.clone();
            self.emit(SyncEvent::MessageUpdated {
                conversation_id: self.inner.id.clone(),
                message: pending.clone(),
            });
            self.publish_changes(&mut state);
            pending
        };

        match self.deliver(&pending).await {
            Ok(confirmed) => Ok(confirmed),
            Err(e) => {
                warn!(conversation = %self.inner.id, placeholder = %hash.short(), error = %e, "retry failed");
                self.mark_failed(hash).await;
                Err(e)
            }
        }
    }

    /// Upload attachments, submit, and swap the pending copy for the
    /// committed one.
    async fn deliver(&self, pending: &Message) -> Result<Message, SyncError> {
        let timeout = self.inner.config.backend_timeout;

        let (outgoing, recipients) = {
            let state = self.inner.state.lock().await;
            let outgoing = state.outbox.get(&pending.hash).cloned().unwrap_or_default();
            let recipients: Vec<AgentKey> = state
                .agent_profiles
                .keys()
                .filter(|key| **key != pending.author_key)
                .cloned()
                .collect();
            (outgoing, recipients)
        };

        let mut images = pending.images.clone();
        for (index, upload) in outgoing.iter().enumerate() {
            let Some(image) = images.get_mut(index) else {
                break;
            };
            if image.storage_entry_hash.is_some() {
                continue;
            }
            let handle = call_with_timeout(
                "upload_attachment",
                timeout,
                self.inner.backend.upload_attachment(upload.bytes.clone()),
            )
            .await?;
            image.storage_entry_hash = Some(handle.clone());
            image.status = ImageStatus::Loaded;

            // Record each handle as soon as it exists so a retry skips it.
            let mut state = self.inner.state.lock().await;
            if let Some(stored) = state
                .messages
                .get_mut(&pending.hash)
                .and_then(|message| message.images.get_mut(index))
            {
                stored.storage_entry_hash = Some(handle);
                stored.status = ImageStatus::Loaded;
            }
        }

        let entry = MessageEntry {
            content: pending.content.clone(),
            bucket: pending.bucket,
            images: images.iter().filter_map(Image::to_descriptor).collect(),
            correlation_id: pending.correlation_id,
        };

        let confirmation = call_with_timeout(
            "submit_message",
            timeout,
            self.inner
                .backend
                .submit_message(&self.inner.id, entry, &recipients),
        )
        .await?;

        let confirmed = Message {
            hash: confirmation.hash.clone(),
            timestamp: confirmation.timestamp,
            status: MessageStatus::Confirmed,
            images,
            ..pending.clone()
        };

        let mut state = self.inner.state.lock().await;
        state.outbox.remove(&pending.hash);
        state.messages.remove(&pending.hash);
        merge_confirmed(&mut state.messages, confirmed.clone());
        state.history.add(pending.bucket, confirmation.hash.clone());
        self.publish_changes(&mut state);

        debug!(
            conversation = %self.inner.id,
            hash = %confirmation.hash.short(),
            bucket = pending.bucket,
            "message confirmed"
        );
        Ok(state
            .messages
            .get(&confirmation.hash)
            .cloned()
            .unwrap_or(confirmed))
    }

    async fn mark_failed(&self, hash: &MessageHash) -> Option<Message> {
        let mut state = self.inner.state.lock().await;
        let message = state.messages.get_mut(hash)?;
        if message.status != MessageStatus::Pending {
            return Some(message.clone());
        }
        message.status = MessageStatus::Failed;
        let failed = message.clone();
        self.emit(SyncEvent::MessageUpdated {
            conversation_id: self.inner.id.clone(),
            message: failed.clone(),
        });
        self.publish_changes(&mut state);
        Some(failed)
    }

    /// Apply a message pushed by the backend.
    ///
    /// Returns the stored message, or `None` when the event was ignored.
    pub async fn handle_realtime(&self, event: RealtimeEvent) -> Option<Message> {
        if event.conversation_id != self.inner.id {
            warn!(
                conversation = %self.inner.id,
                target = %event.conversation_id,
                "realtime event routed to the wrong conversation"
            );
            return None;
        }

        let message = match Message::from_record(&event.record) {
            Ok(message) => message,
            Err(e) => {
                warn!(conversation = %self.inner.id, author = %event.author, error = %e, "undecodable realtime message");
                return None;
            }
        };

        let stored = {
            let mut state = self.inner.state.lock().await;
            let hash = message.hash.clone();
            let bucket = message.bucket;

            let merge = absorb(&mut state, message);
            let discovered = state.history.add(bucket, hash.clone());
            // A replaced placeholder is our own send echoing back.
            if discovered && merge == Merge::Inserted && !self.is_focused() {
                self.set_unread(&mut state, true);
            }
            if merge.changed() {
                self.publish_changes(&mut state);
            }
            state.messages.get(&hash).cloned()
        };

        if let Some(message) = stored.as_ref().filter(|m| m.has_pending_images()) {
            self.spawn_image_loads(message.hash.clone());
        }
        stored
    }

    /// Start downloading the images of `hash` in the background.
    pub fn spawn_image_loads(&self, hash: MessageHash) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move { engine.load_images(&hash).await })
    }

    /// Download every image of `hash` not yet claimed by another loader.
    ///
    /// Images load concurrently; the message is republished as each one
    /// finishes or gives up.
    pub async fn load_images(&self, hash: &MessageHash) {
        let targets: Vec<(usize, EntryHandle, String)> = {
            let mut state = self.inner.state.lock().await;
            let Some(message) = state.messages.get_mut(hash) else {
                return;
            };
            message
                .images
                .iter_mut()
                .enumerate()
                .filter(|(_, image)| image.needs_download())
                .filter_map(|(index, image)| {
                    let handle = image.storage_entry_hash.clone()?;
                    image.status = ImageStatus::Loading;
                    Some((index, handle, image.file_type.clone()))
                })
                .collect()
        };

        let downloads = targets.into_iter().map(|(index, handle, file_type)| async move {
            let result = download_with_retry(
                self.inner.backend.as_ref(),
                &handle,
                self.inner.retry,
                self.inner.config.backend_timeout,
            )
            .await
            .map(|bytes| data_url(&file_type, &bytes));
            self.apply_image(hash, index, result).await;
        });
        join_all(downloads).await;
    }

    async fn apply_image(&self, hash: &MessageHash, index: usize, result: Result<String, SyncError>) {
        let mut state = self.inner.state.lock().await;
        let Some(message) = state.messages.get_mut(hash) else {
            return;
        };
        let Some(image) = message.images.get_mut(index) else {
            return;
        };

        match result {
            Ok(url) => {
                image.data_url = Some(url);
                image.status = ImageStatus::Loaded;
            }
            Err(e) => {
                warn!(conversation = %self.inner.id, hash = %hash.short(), image = %image.name, error = %e, "image failed to load");
                image.status = ImageStatus::Error;
            }
        }

        let updated = message.clone();
        if state.last_message.as_ref().map(|m| &m.hash) == Some(hash) {
            state.last_message = Some(updated.clone());
        }
        self.emit(SyncEvent::MessageUpdated {
            conversation_id: self.inner.id.clone(),
            message: updated,
        });
    }

    /// Bucket for "now", advancing the history index with it.
    async fn advance_clock(&self) -> u32 {
        let current = self.inner.clock.current_bucket();
        self.inner.state.lock().await.history.advance_to(current);
        current
    }

    fn is_focused(&self) -> bool {
        (self.inner.is_focused)(&self.inner.id)
    }

    fn emit(&self, event: SyncEvent) {
        self.inner.events.emit(event);
    }

    /// Publish the message map once, plus the last message if it moved.
    fn publish_changes(&self, state: &mut EngineState) {
        if let Some(last) = state.refresh_last_message() {
            self.emit(SyncEvent::LastMessageChanged {
                conversation_id: self.inner.id.clone(),
                message: last,
            });
        }
        self.emit(SyncEvent::MessagesUpdated {
            conversation_id: self.inner.id.clone(),
            messages: Arc::new(state.sorted_messages()),
        });
    }

    fn set_unread(&self, state: &mut EngineState, unread: bool) {
        if state.unread != unread {
            state.unread = unread;
            self.emit(SyncEvent::UnreadChanged {
                conversation_id: self.inner.id.clone(),
                unread,
            });
        }
    }

    fn set_state(&self, state: &mut EngineState, next: SyncState) {
        if state.sync_state != next {
            state.sync_state = next;
            self.emit(SyncEvent::StateChanged {
                conversation_id: self.inner.id.clone(),
                state: next,
            });
        }
    }
}

/// Merge a confirmed message and drop outbox bytes of the placeholder it
/// replaced.
fn absorb(state: &mut EngineState, message: Message) -> Merge {
    let merge = merge_confirmed(&mut state.messages, message);
    if let Merge::Replaced(placeholder) = &merge {
        state.outbox.remove(placeholder);
    }
    merge
}

fn local_image(image: &OutgoingImage) -> Image {
    Image {
        name: image.name.clone(),
        last_modified: image.last_modified,
        size: image.bytes.len() as u64,
        file_type: image.file_type.clone(),
        storage_entry_hash: None,
        data_url: Some(data_url(&image.file_type, &image.bytes)),
        status: ImageStatus::Pending,
    }
}
