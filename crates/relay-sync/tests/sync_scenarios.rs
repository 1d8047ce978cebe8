mod common;

use std::collections::HashSet;

use relay_shared::{AgentKey, MessageHash};
use relay_store::{HistoryIndex, KvStore};
use relay_sync::{MessageStatus, SyncConfig, SyncError, SyncEvent, SyncState};

use common::*;

#[tokio::test]
async fn test_empty_conversation_initialises_idle() {
    let h = Harness::new();
    assert_eq!(h.engine.sync_state().await, SyncState::Uninitialized);

    h.engine.initialize().await;

    assert_eq!(h.engine.sync_state().await, SyncState::Idle);
    assert!(h.engine.messages().await.is_empty());
    assert!(h.engine.last_message().await.is_none());
    assert!(!h.engine.unread().await);
    // Nothing local, so the walk runs all the way down.
    assert_eq!(h.engine.oldest_bucket_loaded().await, Some(0));
    assert_eq!(h.backend.hash_fetches().len(), CURRENT_BUCKET as usize + 1);
    assert!(h.backend.requested_entries().is_empty());
    assert_eq!(h.engine.agent_profiles().await.len(), 2);
    assert_eq!(h.engine.activity_at().await, h.created_at);
}

#[tokio::test]
async fn test_initialize_runs_once() {
    let h = Harness::new();
    h.engine.initialize().await;
    let fetches = h.backend.hash_fetches().len();

    h.engine.initialize().await;
    assert_eq!(h.backend.hash_fetches().len(), fetches);
}

#[tokio::test]
async fn test_send_shows_pending_then_single_confirmed_copy() {
    let h = Harness::new();
    h.engine.initialize().await;
    let mut rx = h.engine.subscribe();

    let sent = h
        .engine
        .send_message(AgentKey::from(ME), "hello", vec![])
        .await;

    assert_eq!(sent.status, MessageStatus::Confirmed);
    assert_eq!(sent.bucket, CURRENT_BUCKET);
    assert!(sent.hash.as_str().starts_with("uhCkk"));

    let events = drain(&mut rx);
    let first = events
        .iter()
        .find_map(|e| match e {
            SyncEvent::MessagesUpdated { messages, .. } => Some(messages.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].status, MessageStatus::Pending);
    assert_eq!(first[0].content, "hello");

    // A later sync of the same bucket must not duplicate it.
    let loaded = h.engine.load_messages_for_bucket(CURRENT_BUCKET).await;
    assert!(loaded.is_empty());

    let messages = h.engine.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].hash, sent.hash);
    assert_eq!(messages[0].status, MessageStatus::Confirmed);
    assert!(h.backend.requested_entries().is_empty());
    assert_eq!(h.engine.last_message().await.unwrap().hash, sent.hash);
    assert_eq!(h.engine.activity_at().await, sent.timestamp);
    // Our own message is never unread.
    assert!(!h.engine.unread().await);
}

#[tokio::test]
async fn test_send_notifies_everyone_but_the_author() {
    let h = Harness::new();
    h.engine.initialize().await;

    h.engine
        .send_message(AgentKey::from(ME), "hi bob", vec![])
        .await;

    let submissions = h.backend.submissions();
    assert_eq!(submissions.len(), 1);
    let (entry, recipients) = &submissions[0];
    assert_eq!(entry.content, "hi bob");
    assert_eq!(entry.bucket, CURRENT_BUCKET);
    assert!(entry.correlation_id.is_some());
    assert_eq!(recipients, &vec![AgentKey::from(BOB)]);
}

#[tokio::test]
async fn test_page_walk_uses_local_counts() {
    let first = Harness::new();
    first.seed(5);
    first.engine.initialize().await;
    assert_eq!(first.engine.messages().await.len(), 30);

    // Same store, smaller target: the walk stops once 12 are covered.
    let config = SyncConfig {
        target_messages_count: 12,
        ..SyncConfig::default()
    };
    let h = Harness::sharing(
        first.backend.clone(),
        first.store.clone(),
        first.created_at,
        config,
    );
    let before = first.backend.hash_fetches().len();

    h.engine.initialize().await;

    let fetched: Vec<u32> = h.backend.hash_fetches()[before..]
        .iter()
        .map(|(_, bucket)| *bucket)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    assert_eq!(fetched.len(), 3);
    assert!(fetched.iter().all(|b| [5, 4, 3].contains(b)));
    assert_eq!(h.engine.oldest_bucket_loaded().await, Some(3));
    assert_eq!(h.engine.messages().await.len(), 15);

    assert_eq!(h.engine.load_messages_latest_page().await, 3);
    assert_eq!(h.engine.oldest_bucket_loaded().await, Some(0));
    assert_eq!(h.engine.messages().await.len(), 30);

    assert_eq!(h.engine.load_messages_latest_page().await, 0);
}

#[tokio::test]
async fn test_current_page_reload_keeps_older_pages() {
    let config = SyncConfig {
        target_messages_count: 1,
        ..SyncConfig::default()
    };
    let h = Harness::with_config(config);
    h.seed(1);

    // First visit knows nothing locally and walks to the bottom.
    h.engine.initialize().await;
    assert_eq!(h.engine.oldest_bucket_loaded().await, Some(0));

    assert_eq!(h.engine.load_messages_current_page().await, 1);
    assert_eq!(h.engine.oldest_bucket_loaded().await, Some(0));
}

#[tokio::test]
async fn test_load_message_set_from_reports_visited_buckets() {
    let h = Harness::new();
    h.engine.initialize().await;

    assert_eq!(h.engine.load_message_set_from(2).await.unwrap(), 3);
    assert_eq!(h.engine.oldest_bucket_loaded().await, Some(0));
}

#[tokio::test]
async fn test_load_message_set_from_rejects_future_buckets() {
    let h = Harness::new();
    h.engine.initialize().await;
    let fetches = h.backend.hash_fetches().len();

    let err = h
        .engine
        .load_message_set_from(CURRENT_BUCKET + 1000)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::InvalidBucket { bucket, current: CURRENT_BUCKET } if bucket == CURRENT_BUCKET + 1000
    ));
    assert!(h.engine.load_message_set_from(u32::MAX).await.is_err());

    // Nothing was fetched and the cursor did not move.
    assert_eq!(h.backend.hash_fetches().len(), fetches);
    assert_eq!(h.engine.oldest_bucket_loaded().await, Some(0));
    assert_eq!(h.engine.load_message_set_from(CURRENT_BUCKET).await.unwrap(), 6);
}

#[tokio::test]
async fn test_corrupt_bucket_record_is_rebuilt() {
    let h = Harness::new();
    let key = HistoryIndex::storage_key(&conversation(), 2);
    h.store.set(&key, "{not json").unwrap();
    let record = h.bob_says("survives", 2);

    h.engine.initialize().await;

    let message = h.engine.message(&record.hash).await.unwrap();
    assert_eq!(message.content, "survives");
    let rebuilt = h.store.get(&key).unwrap().unwrap();
    assert_eq!(rebuilt, format!(r#"{{"mode":"hashes","payload":["{}"]}}"#, record.hash));
}

#[tokio::test]
async fn test_partial_replication_is_retried_for_the_rest() {
    let h = Harness::new();
    let hashes: Vec<MessageHash> = (0..5)
        .map(|n| h.bob_says(&format!("m{n}"), CURRENT_BUCKET).hash)
        .collect();
    h.backend.set_replication_limit(Some(3)).unwrap();

    h.engine.initialize().await;
    assert_eq!(h.engine.messages().await.len(), 3);
    // Membership is recorded for all five even though only three arrived.
    assert_eq!(h.engine.known_message_count().await, 5);

    h.backend.set_replication_limit(None).unwrap();
    let loaded = h.engine.load_messages_for_bucket(CURRENT_BUCKET).await;
    assert_eq!(loaded.len(), 2);

    let requests = h.backend.requested_entries();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], hashes);
    assert_eq!(requests[1], hashes[3..].to_vec());
    assert_eq!(h.engine.messages().await.len(), 5);
}

#[tokio::test]
async fn test_undecodable_records_are_skipped() {
    let h = Harness::new();
    let good = h.bob_says("fine", CURRENT_BUCKET);
    h.backend
        .insert_record(
            &conversation(),
            CURRENT_BUCKET,
            relay_shared::protocol::MessageRecord {
                hash: MessageHash::from("uhCkkBroken"),
                author: AgentKey::from(BOB),
                timestamp: 0,
                entry: Some(serde_json::json!({"not": "a message"})),
            },
        )
        .unwrap();

    h.engine.initialize().await;

    let messages = h.engine.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].hash, good.hash);
}

#[tokio::test]
async fn test_failed_bucket_does_not_stop_the_page() {
    let h = Harness::new();
    h.seed(1);
    h.backend.set_bucket_failing(3, true).unwrap();

    h.engine.initialize().await;
    assert_eq!(h.engine.messages().await.len(), CURRENT_BUCKET as usize);
    assert_eq!(h.engine.sync_state().await, SyncState::Idle);

    h.backend.set_bucket_failing(3, false).unwrap();
    assert_eq!(h.engine.load_messages_for_bucket(3).await.len(), 1);
}

#[tokio::test]
async fn test_concurrent_bucket_loads_match_sequential() {
    let concurrent = Harness::new();
    concurrent.seed(4);
    let sequential = Harness::sharing(
        concurrent.backend.clone(),
        std::sync::Arc::new(relay_store::MemoryKvStore::new()),
        concurrent.created_at,
        SyncConfig::default(),
    );

    let engine = &concurrent.engine;
    tokio::join!(
        engine.load_messages_for_bucket(5),
        engine.load_messages_for_bucket(3),
        engine.load_messages_for_bucket(4),
        engine.load_messages_for_bucket(5),
    );
    for bucket in [3, 4, 5] {
        sequential.engine.load_messages_for_bucket(bucket).await;
    }

    let a: Vec<MessageHash> = engine.messages().await.into_iter().map(|m| m.hash).collect();
    let b: Vec<MessageHash> = sequential
        .engine
        .messages()
        .await
        .into_iter()
        .map(|m| m.hash)
        .collect();
    assert_eq!(a.len(), 12);
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_bucket_load_publishes_once() {
    let h = Harness::new();
    for n in 0..5 {
        h.bob_says(&format!("m{n}"), CURRENT_BUCKET);
    }
    let mut rx = h.engine.subscribe();

    let loaded = h.engine.load_messages_for_bucket(CURRENT_BUCKET).await;
    assert_eq!(loaded.len(), 5);

    let events = drain(&mut rx);
    assert_eq!(count_messages_updated(&events), 1);
    let last_changes = events
        .iter()
        .filter(|e| matches!(e, SyncEvent::LastMessageChanged { .. }))
        .count();
    assert_eq!(last_changes, 1);
}

#[tokio::test]
async fn test_new_messages_mark_unread_when_unfocused() {
    let h = Harness::new();
    h.bob_says("ping", CURRENT_BUCKET);
    let mut rx = h.engine.subscribe();

    h.engine.initialize().await;
    assert!(h.engine.unread().await);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, SyncEvent::UnreadChanged { unread: true, .. })));

    h.engine.mark_read().await;
    assert!(!h.engine.unread().await);

    // Focus is checked when the hash is discovered.
    h.set_focused(true);
    h.bob_says("pong", CURRENT_BUCKET);
    h.engine.load_messages_for_bucket(CURRENT_BUCKET).await;
    assert!(!h.engine.unread().await);
    assert_eq!(h.engine.messages().await.len(), 2);
}

#[tokio::test]
async fn test_failed_send_can_be_retried() {
    let h = Harness::new();
    h.engine.initialize().await;
    h.backend.fail_next_submits(1).unwrap();

    let failed = h
        .engine
        .send_message(AgentKey::from(ME), "again", vec![])
        .await;
    assert_eq!(failed.status, MessageStatus::Failed);
    assert_eq!(h.engine.messages().await, vec![failed.clone()]);
    assert_eq!(h.engine.known_message_count().await, 0);

    let confirmed = h.engine.retry_send(&failed.hash).await.unwrap();
    assert_eq!(confirmed.status, MessageStatus::Confirmed);
    assert_eq!(confirmed.correlation_id, failed.correlation_id);
    assert_eq!(confirmed.bucket, failed.bucket);

    let messages = h.engine.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].hash, confirmed.hash);
    assert_eq!(h.engine.known_message_count().await, 1);

    assert!(matches!(
        h.engine.retry_send(&confirmed.hash).await,
        Err(SyncError::NotRetryable(_))
    ));
    assert!(matches!(
        h.engine.retry_send(&MessageHash::from("nope")).await,
        Err(SyncError::UnknownMessage(_))
    ));
}

#[tokio::test]
async fn test_retry_that_fails_again_stays_failed() {
    let h = Harness::new();
    h.engine.initialize().await;
    h.backend.fail_next_submits(2).unwrap();

    let failed = h.engine.send_message(AgentKey::from(ME), "x", vec![]).await;
    assert!(h.engine.retry_send(&failed.hash).await.is_err());
    assert_eq!(
        h.engine.message(&failed.hash).await.unwrap().status,
        MessageStatus::Failed
    );
}

#[tokio::test]
async fn test_first_bucket_of_fresh_conversation_is_empty() {
    let h = Harness::new();

    assert_eq!(h.engine.load_message_set_from(0).await.unwrap(), 1);
    assert!(h.engine.load_messages_for_bucket(0).await.is_empty());
    assert!(h.engine.messages().await.is_empty());
    assert_eq!(h.engine.oldest_bucket_loaded().await, Some(0));
}
