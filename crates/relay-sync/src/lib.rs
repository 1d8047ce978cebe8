//! # relay-sync
//!
//! Bucketed message-history synchronisation for Relay conversations.
//!
//! Each conversation gets a [`ConversationSyncEngine`] that pages history in
//! by time bucket, reconciles optimistic sends with their committed copies,
//! and loads image attachments in the background. A
//! [`ConversationRegistry`] ties the engines together for the conversation
//! list.

pub mod attachments;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod memory;
pub mod models;
pub mod registry;
pub mod state;

mod reconcile;

use tracing_subscriber::{fmt, EnvFilter};

pub use backend::Backend;
pub use config::SyncConfig;
pub use engine::{ConversationSettings, ConversationSyncEngine, FocusPredicate};
pub use error::{Result, SyncError};
pub use events::{EventBus, SyncEvent};
pub use models::{Image, ImageStatus, Message, MessageStatus, OutgoingImage};
pub use registry::ConversationRegistry;
pub use state::{ConversationSnapshot, SyncState};

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` overrides the default filter. Calling this more than once is
/// harmless; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("relay_sync=debug,relay_store=info,warn"));

    let installed = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();

    if installed.is_ok() {
        tracing::info!(app = relay_shared::constants::APP_NAME, "tracing initialised");
    }
}
