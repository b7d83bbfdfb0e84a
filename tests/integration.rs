// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests for change-feed consumption and replication.
//!
//! Everything runs against the in-memory document store, including its
//! failure-injection hooks for interruption and outage scenarios.
//!
//! # Test Organization
//! - `changes_*` - pull/push feed consumption and fan-out
//! - `replication_*` - one-shot batched replication
//! - `conflict_*` - conflict policy behavior
//! - `bidirectional_*` - paired passes and continuous sync

mod common;

use common::{init_tracing, seeded_store, wait_until};
use docsync::{
    BatchReplicator, BidirectionalConfig, BidirectionalReplicator, ChangesFeed, ChangesListener,
    ConflictResolver, FeedConfig, FeedMode, ListenerConfig, MemoryDocumentStore, ReplicatorConfig,
    Since,
};
use docsync::store::DocumentStore;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Changes: pull mode
// =============================================================================

#[tokio::test]
async fn changes_pull_returns_published_window_in_order() {
    init_tracing();
    let store = Arc::new(MemoryDocumentStore::new());
    let listener = ChangesListener::new(Arc::clone(&store), ListenerConfig::default());

    // Publish 3 changes, remember the boundary, publish 4 more
    for i in 0..3 {
        store
            .put_document(&format!("before:{i}"), None, json!({"i": i}))
            .await
            .unwrap();
    }
    let boundary = store.last_seq();
    for i in 0..4 {
        store
            .put_document(&format!("after:{i}"), None, json!({"i": i}))
            .await
            .unwrap();
    }
    let head = store.last_seq();

    let page = listener
        .get_changes(Since::seq(&boundary), 4)
        .await
        .unwrap();
    assert_eq!(page.len(), 4);
    assert_eq!(page.last_seq, head);
    let seqs: Vec<u64> = page.results.iter().map(|c| c.seq.parse().unwrap()).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);
    assert!(page.results.iter().all(|c| c.id.starts_with("after:")));
}

#[tokio::test]
async fn changes_pull_with_docs_carries_bodies() {
    let store = seeded_store(2).await;
    let config = ListenerConfig {
        include_docs: true,
        ..ListenerConfig::default()
    };
    let listener = ChangesListener::new(Arc::clone(&store), config);
    let page = listener.get_changes(Since::Beginning, 10).await.unwrap();
    assert!(page.results.iter().all(|c| c.has_doc()));
}

// =============================================================================
// Changes: push mode lifecycle
// =============================================================================

#[tokio::test]
async fn changes_listener_stop_guarantees_no_further_callbacks() {
    init_tracing();
    let store = seeded_store(3).await;
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = Arc::clone(&count);

    let listener = ChangesListener::new(Arc::clone(&store), ListenerConfig::for_testing())
        .on_change(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
    listener.start().await.unwrap();
    assert!(wait_until(3000, || count.load(Ordering::SeqCst) == 3).await);

    listener.stop().await;
    let frozen = count.load(Ordering::SeqCst);

    // Publish after stop and assert callback-count stability over a delay
    for i in 0..5 {
        store
            .put_document(&format!("late:{i}"), None, json!({}))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(count.load(Ordering::SeqCst), frozen);
}

#[tokio::test]
async fn changes_listener_survives_feed_interruption() {
    init_tracing();
    let store = seeded_store(1).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(AtomicUsize::new(0));
    let (seen2, errors2) = (Arc::clone(&seen), Arc::clone(&errors));

    let listener = ChangesListener::new(Arc::clone(&store), ListenerConfig::for_testing())
        .on_change(move |c| seen2.lock().unwrap().push(c.seq))
        .on_error(move |_| {
            errors2.fetch_add(1, Ordering::SeqCst);
        });
    listener.start().await.unwrap();
    assert!(wait_until(3000, || seen.lock().unwrap().len() == 1).await);

    // Drop the connection twice; the listener must resume each time
    // without re-delivering anything.
    for round in 0..2 {
        store.interrupt_feeds();
        store
            .put_document(&format!("recovered:{round}"), None, json!({}))
            .await
            .unwrap();
        assert!(wait_until(3000, || seen.lock().unwrap().len() == 2 + round).await);
    }
    assert!(errors.load(Ordering::SeqCst) >= 2);

    let seqs = seen.lock().unwrap().clone();
    let unique: std::collections::HashSet<_> = seqs.iter().collect();
    assert_eq!(unique.len(), seqs.len(), "no change delivered twice");

    listener.stop().await;
}

// =============================================================================
// Changes: fan-out
// =============================================================================

#[tokio::test]
async fn changes_feed_buffers_and_fans_out() {
    init_tracing();
    let store = seeded_store(0).await;
    let config = FeedConfig {
        buffer_size: 5,
        ..FeedConfig::for_testing()
    };
    let feed = ChangesFeed::new(Arc::clone(&store), config);

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let (f2, s2) = (Arc::clone(&first), Arc::clone(&second));
    feed.subscribe(move |_| {
        f2.fetch_add(1, Ordering::SeqCst);
    });
    feed.subscribe(move |_| {
        s2.fetch_add(1, Ordering::SeqCst);
    });

    feed.start(FeedMode::Continuous, true).await.unwrap();
    for i in 0..8 {
        store
            .put_document(&format!("doc:{i}"), None, json!({"i": i}))
            .await
            .unwrap();
    }

    assert!(wait_until(3000, || first.load(Ordering::SeqCst) == 8).await);
    assert_eq!(second.load(Ordering::SeqCst), 8);

    // Ring buffer keeps only the newest five, oldest first
    let buffer = feed.get_buffer();
    assert_eq!(buffer.len(), 5);
    let seqs: Vec<u64> = buffer.iter().map(|c| c.seq.parse().unwrap()).collect();
    assert_eq!(seqs, vec![4, 5, 6, 7, 8]);
    assert!(buffer.iter().all(|c| c.has_doc()));

    feed.stop().await;
}

// =============================================================================
// Replication: one-shot
// =============================================================================

#[tokio::test]
async fn replication_round_trip_batch_of_three() {
    init_tracing();
    let source = seeded_store(10).await;
    let target = Arc::new(MemoryDocumentStore::new());

    let result = BatchReplicator::new(
        Arc::clone(&source),
        Arc::clone(&target),
        ReplicatorConfig { batch_size: 3 },
    )
    .replicate()
    .await
    .unwrap();

    assert_eq!(result.stats.docs_read, 10);
    assert_eq!(result.stats.docs_written, 10);
    assert_eq!(result.stats.doc_write_failures, 0);
    assert!(result.stats.duration > Duration::ZERO);
    assert!(result.stats.docs_per_second() > 0.0);
    assert_eq!(target.document_count(), 10);

    for i in 0..10 {
        let id = format!("doc:{i:02}");
        let src = source.get_document(&id).await.unwrap().unwrap();
        let tgt = target.get_document(&id).await.unwrap().unwrap();
        assert_eq!(src.body, tgt.body, "body mismatch for {id}");
    }
}

#[tokio::test]
async fn replication_is_idempotent() {
    let source = seeded_store(10).await;
    let target = Arc::new(MemoryDocumentStore::new());
    let replicator = BatchReplicator::new(
        Arc::clone(&source),
        Arc::clone(&target),
        ReplicatorConfig { batch_size: 3 },
    );

    let first = replicator.replicate().await.unwrap();
    let second = replicator.replicate().await.unwrap();

    assert_eq!(first.stats.docs_written, second.stats.docs_written);
    assert!(second.is_clean());
    assert_eq!(target.document_count(), 10);
}

#[tokio::test]
async fn replication_filter_writes_only_matches() {
    init_tracing();
    let source = Arc::new(MemoryDocumentStore::new());
    for i in 0..20 {
        // 7 of 20 are high priority (i = 0, 3, 6, 9, 12, 15, 18)
        let priority = if i % 3 == 0 { "high" } else { "low" };
        source
            .put_document(&format!("doc:{i:02}"), None, json!({"priority": priority, "i": i}))
            .await
            .unwrap();
    }
    let target = Arc::new(MemoryDocumentStore::new());

    let result = BatchReplicator::new(
        Arc::clone(&source),
        Arc::clone(&target),
        ReplicatorConfig::default(),
    )
    .with_filter(|body| body["priority"] == "high")
    .replicate()
    .await
    .unwrap();

    assert_eq!(result.stats.docs_read, 20);
    assert_eq!(result.stats.docs_written, 7);
    assert_eq!(target.document_count(), 7);
}

#[tokio::test]
async fn replication_reports_partial_failure_and_continues() {
    let source = seeded_store(6).await;
    let target = Arc::new(MemoryDocumentStore::new());
    // Three ids already exist on the target with independent revisions
    for i in [1, 3, 5] {
        target
            .put_document(&format!("doc:{i:02}"), None, json!({"independent": i}))
            .await
            .unwrap();
    }

    let result = BatchReplicator::new(
        Arc::clone(&source),
        Arc::clone(&target),
        ReplicatorConfig { batch_size: 2 },
    )
    .replicate()
    .await
    .unwrap();

    assert_eq!(result.stats.docs_read, 6);
    assert_eq!(result.stats.docs_written, 3);
    assert_eq!(result.stats.doc_write_failures, 3);
    let failed: Vec<_> = result.failures.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(failed, vec!["doc:01", "doc:03", "doc:05"]);

    // Conflicted targets untouched
    let doc = target.get_document("doc:03").await.unwrap().unwrap();
    assert_eq!(doc.body["independent"], 3);
}

// =============================================================================
// Conflict policy determinism
// =============================================================================

/// Same id created independently on both sides, source copy older.
async fn conflicting_pair() -> (Arc<MemoryDocumentStore>, Arc<MemoryDocumentStore>) {
    let source = Arc::new(MemoryDocumentStore::new());
    let target = Arc::new(MemoryDocumentStore::new());
    source
        .put_document(
            "conflict:doc",
            None,
            json!({"value": "A", "updated_at": "2025-11-03T09:00:00Z"}),
        )
        .await
        .unwrap();
    target
        .put_document(
            "conflict:doc",
            None,
            json!({"value": "B", "updated_at": "2025-11-03T10:00:00Z"}),
        )
        .await
        .unwrap();
    (source, target)
}

#[tokio::test]
async fn conflict_source_wins_overwrites_target() {
    let (source, target) = conflicting_pair().await;
    BatchReplicator::new(Arc::clone(&source), Arc::clone(&target), ReplicatorConfig::default())
        .with_resolver(ConflictResolver::source_wins())
        .replicate()
        .await
        .unwrap();
    let doc = target.get_document("conflict:doc").await.unwrap().unwrap();
    assert_eq!(doc.body["value"], "A");
}

#[tokio::test]
async fn conflict_latest_wins_keeps_newer_target() {
    let (source, target) = conflicting_pair().await;
    let result = BatchReplicator::new(
        Arc::clone(&source),
        Arc::clone(&target),
        ReplicatorConfig::default(),
    )
    .with_resolver(ConflictResolver::latest_wins("updated_at"))
    .replicate()
    .await
    .unwrap();

    assert!(result.is_clean());
    assert_eq!(result.stats.docs_written, 0);
    let doc = target.get_document("conflict:doc").await.unwrap().unwrap();
    assert_eq!(doc.body["value"], "B");
}

#[tokio::test]
async fn conflict_custom_resolver_merges_bodies() {
    let (source, target) = conflicting_pair().await;
    BatchReplicator::new(Arc::clone(&source), Arc::clone(&target), ReplicatorConfig::default())
        .with_resolver(ConflictResolver::custom(|incoming, existing| {
            let mut merged = existing.clone();
            merged["value"] = incoming["value"].clone();
            merged["merged"] = json!(true);
            Ok(merged)
        }))
        .replicate()
        .await
        .unwrap();

    let doc = target.get_document("conflict:doc").await.unwrap().unwrap();
    assert_eq!(doc.body["value"], "A");
    assert_eq!(doc.body["merged"], true);
    assert_eq!(doc.body["updated_at"], "2025-11-03T10:00:00Z");
}

// =============================================================================
// Bidirectional
// =============================================================================

#[tokio::test]
async fn bidirectional_pass_converges_to_union() {
    init_tracing();
    let a = Arc::new(MemoryDocumentStore::new());
    let b = Arc::new(MemoryDocumentStore::new());
    for i in 0..5 {
        a.put_document(&format!("a:{i}"), None, json!({"from": "a"}))
            .await
            .unwrap();
    }
    for i in 0..3 {
        b.put_document(&format!("b:{i}"), None, json!({"from": "b"}))
            .await
            .unwrap();
    }

    let replicator = BidirectionalReplicator::new(
        Arc::clone(&a),
        Arc::clone(&b),
        BidirectionalConfig::for_testing(),
    );

    let first = replicator.run_once().await.unwrap();
    assert_eq!(first.a_to_b.stats.docs_written, 5);
    assert_eq!(first.b_to_a.stats.docs_written, 3);
    assert_eq!(a.document_count(), 8);
    assert_eq!(b.document_count(), 8);

    // A second pass moves nothing in either direction
    let second = replicator.run_once().await.unwrap();
    assert_eq!(second.a_to_b.stats.docs_written, 0);
    assert_eq!(second.b_to_a.stats.docs_written, 0);

    let stats = replicator.stats().await;
    assert_eq!(stats.a_to_b.docs_written, 5);
    assert_eq!(stats.b_to_a.docs_written, 3);
}

#[tokio::test]
async fn bidirectional_continuous_sync_end_to_end() {
    init_tracing();
    let a = Arc::new(MemoryDocumentStore::new());
    let b = Arc::new(MemoryDocumentStore::new());
    let config = BidirectionalConfig {
        continuous: true,
        ..BidirectionalConfig::for_testing()
    };
    let replicator =
        BidirectionalReplicator::new(Arc::clone(&a), Arc::clone(&b), config);
    replicator.start().await.unwrap();

    // Alternate writes on both sides, live
    for i in 0..3 {
        a.put_document(&format!("live:a{i}"), None, json!({"i": i}))
            .await
            .unwrap();
        b.put_document(&format!("live:b{i}"), None, json!({"i": i}))
            .await
            .unwrap();
    }
    assert!(wait_until(5000, || a.document_count() == 6 && b.document_count() == 6).await);

    replicator.stop().await;

    // Stopped means stopped
    a.put_document("late", None, json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(b.document_count(), 6);

    // And the instance cannot be revived
    assert!(replicator.start().await.is_err());
}
