//! Merging confirmed messages into the local map.
//!
//! A confirmed message may reach the engine three ways: the submit
//! confirmation, a bucket fetch, or a realtime push. Whichever arrives first
//! replaces the sender's pending copy; later arrivals of the same hash are
//! no-ops. Merging is keyed by hash, so arrival order does not change the
//! resulting set.

use std::collections::HashMap;

use relay_shared::MessageHash;

use crate::models::{ImageStatus, Message};

/// What a merge did to the map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Merge {
    Inserted,
    /// Inserted, and the pending message with this placeholder was removed.
    Replaced(MessageHash),
    /// The hash was already present.
    Unchanged,
}

impl Merge {
    pub fn changed(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// The unconfirmed local message `incoming` stands for, if any.
///
/// Correlation ids are authoritative when the incoming entry carries one.
/// Entries written by older clients have none and fall back to matching
/// author and content.
pub(crate) fn find_pending_match(
    messages: &HashMap<MessageHash, Message>,
    incoming: &Message,
) -> Option<MessageHash> {
    let unconfirmed = messages.values().filter(|m| !m.is_confirmed());

    let mut candidates: Vec<&Message> = match incoming.correlation_id {
        Some(id) => unconfirmed.filter(|m| m.correlation_id == Some(id)).collect(),
        None => unconfirmed
            .filter(|m| m.author_key == incoming.author_key && m.content == incoming.content)
            .collect(),
    };
    // Oldest first, so duplicate texts confirm in send order.
    candidates.sort_by(|a, b| crate::models::chronological(a, b));
    candidates.first().map(|m| m.hash.clone())
}

/// Merge a confirmed message into `messages`.
pub(crate) fn merge_confirmed(
    messages: &mut HashMap<MessageHash, Message>,
    mut incoming: Message,
) -> Merge {
    if messages.contains_key(&incoming.hash) {
        return Merge::Unchanged;
    }

    match find_pending_match(messages, &incoming) {
        Some(placeholder) => {
            if let Some(pending) = messages.remove(&placeholder) {
                adopt_local_previews(&mut incoming, &pending);
            }
            messages.insert(incoming.hash.clone(), incoming);
            Merge::Replaced(placeholder)
        }
        None => {
            messages.insert(incoming.hash.clone(), incoming);
            Merge::Inserted
        }
    }
}

/// Reuse image bytes the sender already has instead of downloading them.
fn adopt_local_previews(confirmed: &mut Message, pending: &Message) {
    for (image, local) in confirmed.images.iter_mut().zip(&pending.images) {
        if image.name == local.name && local.data_url.is_some() {
            image.data_url = local.data_url.clone();
            image.status = ImageStatus::Loaded;
        }
    }
}
