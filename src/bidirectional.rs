// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bidirectional replication between two document stores.
//!
//! [`BidirectionalReplicator`] composes two [`BatchReplicator`] directions,
//! A→B and B→A, either as paired passes driven by
//! [`run_once`](BidirectionalReplicator::run_once) or as a continuous loop
//! fed by one [`ChangesListener`](crate::listener::ChangesListener) per
//! direction.
//!
//! # Loop Prevention
//!
//! Every write performed by a direction stamps an origin marker (a body
//! field, configurable) with that direction's source label. The reverse
//! direction skips any document whose marker carries the opposing label:
//! its latest revision originated from the other store, and sending it
//! back would only bounce it forever. Genuine local edits carry no marker
//! and replicate normally. The marker travels with the document, so the
//! invariant survives process restarts with no external ledger.
//!
//! # Checkpoints
//!
//! Each direction keeps the sequence token its last pass ended at and the
//! next pass resumes from there, so repeated passes over quiesced stores
//! read only reverse-direction echoes (which the origin marker skips) and
//! write nothing.

use crate::change::{Change, Since};
use crate::config::{BidirectionalConfig, ListenerConfig};
use crate::conflict::ConflictResolver;
use crate::error::{ReplicationError, Result, StoreError};
use crate::listener::ChangesListener;
use crate::replicator::{BatchReplicator, OriginTag, ReplicationResult, ReplicationStats};
use crate::store::DocumentStore;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed; passes may run, continuous mode may start.
    Created,
    /// Continuous listeners and workers are active.
    Running,
    /// Terminal. Construct a new instance to replicate again.
    Stopped,
}

/// Per-direction stats, always read and written as one consistent pair.
#[derive(Debug, Clone, Default)]
pub struct BidirectionalStats {
    /// Accumulated counters for the A→B direction.
    pub a_to_b: ReplicationStats,
    /// Accumulated counters for the B→A direction.
    pub b_to_a: ReplicationStats,
}

/// Outcome of one paired pass.
#[derive(Debug, Clone)]
pub struct BidirectionalPass {
    /// Result of the A→B run.
    pub a_to_b: ReplicationResult,
    /// Result of the B→A run.
    pub b_to_a: ReplicationResult,
}

struct Checkpoints {
    a: Since,
    b: Since,
}

/// Which stats slot a direction worker reports into.
#[derive(Clone, Copy)]
enum Direction {
    AToB,
    BToA,
}

/// Orchestrates replication in both directions between two stores.
pub struct BidirectionalReplicator<A: DocumentStore, B: DocumentStore> {
    store_a: Arc<A>,
    store_b: Arc<B>,
    config: BidirectionalConfig,
    resolver: Option<ConflictResolver>,
    stats: Arc<Mutex<BidirectionalStats>>,
    checkpoints: Mutex<Checkpoints>,
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    listener_a: Mutex<Option<ChangesListener<A>>>,
    listener_b: Mutex<Option<ChangesListener<B>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<A: DocumentStore, B: DocumentStore> BidirectionalReplicator<A, B> {
    /// Create a replicator between `store_a` and `store_b`.
    pub fn new(store_a: Arc<A>, store_b: Arc<B>, config: BidirectionalConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store_a,
            store_b,
            config,
            resolver: None,
            stats: Arc::new(Mutex::new(BidirectionalStats::default())),
            checkpoints: Mutex::new(Checkpoints {
                a: Since::Beginning,
                b: Since::Beginning,
            }),
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            listener_a: Mutex::new(None),
            listener_b: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Route conflicts in both directions through `resolver`.
    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Check if continuous replication is active.
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Consistent snapshot of both directions' accumulated stats. Safe to
    /// call concurrently with an in-progress continuous run.
    pub async fn stats(&self) -> BidirectionalStats {
        self.stats.lock().await.clone()
    }

    fn replicator_ab(&self) -> BatchReplicator<A, B> {
        let mut repl = BatchReplicator::new(
            Arc::clone(&self.store_a),
            Arc::clone(&self.store_b),
            self.config.replicator.clone(),
        )
        .with_label("a_to_b")
        .with_origin(OriginTag {
            field: self.config.origin_field.clone(),
            write: self.config.origin_a.clone(),
            skip: self.config.origin_b.clone(),
        });
        if let Some(resolver) = &self.resolver {
            repl = repl.with_resolver(resolver.clone());
        }
        repl
    }

    fn replicator_ba(&self) -> BatchReplicator<B, A> {
        let mut repl = BatchReplicator::new(
            Arc::clone(&self.store_b),
            Arc::clone(&self.store_a),
            self.config.replicator.clone(),
        )
        .with_label("b_to_a")
        .with_origin(OriginTag {
            field: self.config.origin_field.clone(),
            write: self.config.origin_b.clone(),
            skip: self.config.origin_a.clone(),
        });
        if let Some(resolver) = &self.resolver {
            repl = repl.with_resolver(resolver.clone());
        }
        repl
    }

    /// Run one paired pass: both directions replicate the changes since
    /// their checkpoints, concurrently, then the checkpoints advance.
    ///
    /// Fails with `InvalidState` while a continuous run is active or after
    /// `stop()`.
    pub async fn run_once(&self) -> Result<BidirectionalPass> {
        self.config.validate()?;
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        let (since_a, since_b) = {
            let cp = self.checkpoints.lock().await;
            (cp.a.clone(), cp.b.clone())
        };
        debug!(since_a = %since_a, since_b = %since_b, "Starting paired pass");

        let ab = self.replicator_ab();
        let ba = self.replicator_ba();
        let (result_ab, result_ba) =
            tokio::join!(ab.replicate_since(since_a), ba.replicate_since(since_b));
        let result_ab = result_ab?;
        let result_ba = result_ba?;

        {
            let mut cp = self.checkpoints.lock().await;
            if let Some(seq) = &result_ab.last_seq {
                cp.a = Since::seq(seq);
            }
            if let Some(seq) = &result_ba.last_seq {
                cp.b = Since::seq(seq);
            }
        }
        {
            // One lock for both directions: readers never observe a
            // half-updated pair.
            let mut stats = self.stats.lock().await;
            stats.a_to_b.merge(&result_ab.stats);
            stats.b_to_a.merge(&result_ba.stats);
        }

        info!(
            a_to_b_written = result_ab.stats.docs_written,
            b_to_a_written = result_ba.stats.docs_written,
            "Paired pass complete"
        );
        Ok(BidirectionalPass {
            a_to_b: result_ab,
            b_to_a: result_ba,
        })
    }

    /// Start continuous replication: one change listener plus one worker
    /// task per direction, running until [`stop`](Self::stop).
    ///
    /// Fails with `Config` when the instance was not configured as
    /// continuous, and with `InvalidState` unless freshly created. Both
    /// stores must be reachable.
    pub async fn start(&self) -> Result<()> {
        self.config.validate()?;
        if !self.config.continuous {
            return Err(ReplicationError::Config(
                "continuous mode is disabled; drive passes with run_once()".to_string(),
            ));
        }
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        for (name, up) in [
            ("A", self.store_a.ping().await),
            ("B", self.store_b.ping().await),
        ] {
            let up = up.map_err(|e| ReplicationError::store("ping", e))?;
            if !up {
                return Err(ReplicationError::store(
                    "ping",
                    StoreError::Unavailable(format!("store {name} unreachable")),
                ));
            }
        }

        let _ = self.state_tx.send(EngineState::Running);
        info!("Starting continuous bidirectional replication");

        let listener_config = ListenerConfig {
            include_docs: false,
            reconnect: self.config.reconnect.clone(),
            ..ListenerConfig::default()
        };
        let batch_size = self.config.replicator.batch_size;
        let mut workers = self.workers.lock().await;

        // A→B
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = ChangesListener::new(Arc::clone(&self.store_a), listener_config.clone())
            .on_change(move |change| {
                let _ = tx.send(change);
            })
            .on_error(|e| warn!(direction = "a_to_b", error = %e, "Source feed interrupted"));
        listener.start().await?;
        *self.listener_a.lock().await = Some(listener);
        workers.push(tokio::spawn(run_direction(
            self.replicator_ab(),
            rx,
            self.shutdown_rx.clone(),
            Arc::clone(&self.stats),
            Direction::AToB,
            batch_size,
        )));

        // B→A
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = ChangesListener::new(Arc::clone(&self.store_b), listener_config)
            .on_change(move |change| {
                let _ = tx.send(change);
            })
            .on_error(|e| warn!(direction = "b_to_a", error = %e, "Source feed interrupted"));
        listener.start().await?;
        *self.listener_b.lock().await = Some(listener);
        workers.push(tokio::spawn(run_direction(
            self.replicator_ba(),
            rx,
            self.shutdown_rx.clone(),
            Arc::clone(&self.stats),
            Direction::BToA,
            batch_size,
        )));

        Ok(())
    }

    /// Stop both directions. Idempotent; when this returns, the listeners
    /// and workers have terminated. The instance cannot be restarted.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        if let Some(listener) = self.listener_a.lock().await.take() {
            listener.stop().await;
        }
        if let Some(listener) = self.listener_b.lock().await.take() {
            listener.stop().await;
        }

        let workers: Vec<_> = {
            let mut guard = self.workers.lock().await;
            std::mem::take(&mut *guard)
        };
        for (i, worker) in workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                warn!(worker = i, error = %e, "Direction worker panicked during shutdown");
            }
        }

        let _ = self.state_tx.send(EngineState::Stopped);
        info!("Bidirectional replication stopped");
    }
}

/// Drain a direction's change queue into batched replication runs.
async fn run_direction<S: DocumentStore, T: DocumentStore>(
    replicator: BatchReplicator<S, T>,
    mut rx: mpsc::UnboundedReceiver<Change>,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<Mutex<BidirectionalStats>>,
    direction: Direction,
    batch_size: usize,
) {
    loop {
        let first = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            item = rx.recv() => match item {
                Some(change) => change,
                None => break,
            },
        };

        // Coalesce whatever else is already queued, up to one batch.
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        if !first.deleted && seen.insert(first.id.clone()) {
            ids.push(first.id);
        }
        while ids.len() < batch_size {
            match rx.try_recv() {
                Ok(change) => {
                    if !change.deleted && seen.insert(change.id.clone()) {
                        ids.push(change.id);
                    }
                }
                Err(_) => break,
            }
        }
        if ids.is_empty() {
            continue;
        }

        match replicator.replicate_ids(&ids).await {
            Ok(result) => {
                let mut stats = stats.lock().await;
                match direction {
                    Direction::AToB => stats.a_to_b.merge(&result.stats),
                    Direction::BToA => stats.b_to_a.merge(&result.stats),
                }
            }
            Err(e) => warn!(error = %e, "Continuous direction pass failed"),
        }
    }
    debug!("Direction worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDocumentStore;
    use serde_json::json;
    use std::time::Duration;

    async fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..(deadline_ms / 5).max(1) {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }

    async fn disjoint_stores() -> (Arc<MemoryDocumentStore>, Arc<MemoryDocumentStore>) {
        let a = Arc::new(MemoryDocumentStore::new());
        let b = Arc::new(MemoryDocumentStore::new());
        for i in 0..5 {
            a.put_document(&format!("a:{i}"), None, json!({"from": "a", "i": i}))
                .await
                .unwrap();
        }
        for i in 0..3 {
            b.put_document(&format!("b:{i}"), None, json!({"from": "b", "i": i}))
                .await
                .unwrap();
        }
        (a, b)
    }

    #[tokio::test]
    async fn test_one_pass_converges_disjoint_sets() {
        let (a, b) = disjoint_stores().await;
        let repl = BidirectionalReplicator::new(
            Arc::clone(&a),
            Arc::clone(&b),
            BidirectionalConfig::for_testing(),
        );

        let pass = repl.run_once().await.unwrap();
        assert_eq!(pass.a_to_b.stats.docs_written, 5);
        assert_eq!(pass.b_to_a.stats.docs_written, 3);
        assert!(pass.a_to_b.is_clean() && pass.b_to_a.is_clean());
        assert_eq!(a.document_count(), 8);
        assert_eq!(b.document_count(), 8);

        // Replicated copies carry the origin marker; originals do not
        let copied = b.get_document("a:0").await.unwrap().unwrap();
        assert_eq!(copied.body["_replicated_from"], "a");
        let original = a.get_document("a:0").await.unwrap().unwrap();
        assert!(original.body.get("_replicated_from").is_none());
    }

    #[tokio::test]
    async fn test_second_pass_writes_nothing() {
        let (a, b) = disjoint_stores().await;
        let repl = BidirectionalReplicator::new(
            Arc::clone(&a),
            Arc::clone(&b),
            BidirectionalConfig::for_testing(),
        );

        repl.run_once().await.unwrap();
        let second = repl.run_once().await.unwrap();
        assert_eq!(second.a_to_b.stats.docs_written, 0);
        assert_eq!(second.b_to_a.stats.docs_written, 0);
        assert_eq!(a.document_count(), 8);
        assert_eq!(b.document_count(), 8);

        // Stats accumulated across both passes, as one consistent pair
        let stats = repl.stats().await;
        assert_eq!(stats.a_to_b.docs_written, 5);
        assert_eq!(stats.b_to_a.docs_written, 3);
    }

    #[tokio::test]
    async fn test_local_edit_replicates_after_first_pass() {
        let (a, b) = disjoint_stores().await;
        let repl = BidirectionalReplicator::new(
            Arc::clone(&a),
            Arc::clone(&b),
            BidirectionalConfig::for_testing(),
        );
        repl.run_once().await.unwrap();

        // A genuine edit on B (no origin marker) must flow back to A
        let doc = b.get_document("b:0").await.unwrap().unwrap();
        b.put_document("b:0", doc.rev.as_deref(), json!({"from": "b", "edited": true}))
            .await
            .unwrap();

        let pass = repl.run_once().await.unwrap();
        assert!(pass.b_to_a.stats.docs_read >= 1);
        // The edit conflicts with A's copy from pass one; without a
        // resolver it is recorded, not silently dropped
        assert_eq!(pass.b_to_a.stats.doc_write_failures, 1);
        assert_eq!(pass.b_to_a.failures[0].id, "b:0");
    }

    #[tokio::test]
    async fn test_conflicting_docs_with_resolver() {
        let a = Arc::new(MemoryDocumentStore::new());
        let b = Arc::new(MemoryDocumentStore::new());
        a.put_document("x", None, json!({"value": "A", "ts": 200}))
            .await
            .unwrap();
        b.put_document("x", None, json!({"value": "B", "ts": 100}))
            .await
            .unwrap();

        let repl = BidirectionalReplicator::new(
            Arc::clone(&a),
            Arc::clone(&b),
            BidirectionalConfig::for_testing(),
        )
        .with_resolver(ConflictResolver::latest_wins("ts"));

        let pass = repl.run_once().await.unwrap();
        assert!(pass.a_to_b.is_clean() && pass.b_to_a.is_clean());

        // The newer value wins on B; A keeps its own (B's older copy skipped)
        let on_b = b.get_document("x").await.unwrap().unwrap();
        assert_eq!(on_b.body["value"], "A");
        let on_a = a.get_document("x").await.unwrap().unwrap();
        assert_eq!(on_a.body["value"], "A");
    }

    #[tokio::test]
    async fn test_lifecycle_guards() {
        let (a, b) = disjoint_stores().await;

        // Non-continuous instance rejects start()
        let repl = BidirectionalReplicator::new(
            Arc::clone(&a),
            Arc::clone(&b),
            BidirectionalConfig::for_testing(),
        );
        assert!(matches!(
            repl.start().await.unwrap_err(),
            ReplicationError::Config(_)
        ));

        // After stop, neither passes nor starts are allowed
        repl.stop().await;
        assert_eq!(repl.state(), EngineState::Stopped);
        assert!(matches!(
            repl.run_once().await.unwrap_err(),
            ReplicationError::InvalidState { .. }
        ));

        let config = BidirectionalConfig {
            continuous: true,
            ..BidirectionalConfig::for_testing()
        };
        let repl = BidirectionalReplicator::new(Arc::clone(&a), Arc::clone(&b), config);
        repl.stop().await;
        assert!(matches!(
            repl.start().await.unwrap_err(),
            ReplicationError::InvalidState { .. }
        ));
    }

    #[tokio::test]
    async fn test_start_requires_reachable_stores() {
        let (a, b) = disjoint_stores().await;
        b.set_unavailable(true);
        let config = BidirectionalConfig {
            continuous: true,
            ..BidirectionalConfig::for_testing()
        };
        let repl = BidirectionalReplicator::new(Arc::clone(&a), Arc::clone(&b), config);
        let err = repl.start().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(repl.state(), EngineState::Created);
    }

    #[tokio::test]
    async fn test_continuous_replication_converges_live() {
        let (a, b) = disjoint_stores().await;
        let config = BidirectionalConfig {
            continuous: true,
            ..BidirectionalConfig::for_testing()
        };
        let repl = Arc::new(BidirectionalReplicator::new(
            Arc::clone(&a),
            Arc::clone(&b),
            config,
        ));
        repl.start().await.unwrap();
        assert!(repl.is_running());

        // Initial histories flow both ways
        assert!(wait_until(3000, || a.document_count() == 8 && b.document_count() == 8).await);

        // Live writes on either side propagate
        a.put_document("live:a", None, json!({"from": "a"}))
            .await
            .unwrap();
        b.put_document("live:b", None, json!({"from": "b"}))
            .await
            .unwrap();
        assert!(wait_until(3000, || a.document_count() == 10 && b.document_count() == 10).await);

        repl.stop().await;
        assert_eq!(repl.state(), EngineState::Stopped);

        // Nothing moves after stop
        a.put_document("late", None, json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(b.document_count(), 10);
    }

    #[tokio::test]
    async fn test_stats_snapshot_during_continuous_run() {
        let (a, b) = disjoint_stores().await;
        let config = BidirectionalConfig {
            continuous: true,
            ..BidirectionalConfig::for_testing()
        };
        let repl = BidirectionalReplicator::new(Arc::clone(&a), Arc::clone(&b), config);
        repl.start().await.unwrap();

        assert!(wait_until(3000, || b.document_count() == 8).await);
        let stats = repl.stats().await;
        assert!(stats.a_to_b.docs_written >= 5);

        repl.stop().await;
    }
}
