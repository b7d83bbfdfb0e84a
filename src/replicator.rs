//! Batched unidirectional document replication.
//!
//! [`BatchReplicator`] copies documents from a source store to a target
//! store in bounded batches, with optional filtering and pluggable
//! conflict resolution. Replication is best-effort: a per-document write
//! failure never aborts the batch or the run - failures are accumulated
//! and reported in the final [`ReplicationResult`].
//!
//! # Pipeline
//!
//! ```text
//! enumerate ids ──▶ page of batch_size ──▶ read bodies from source
//!                                             │ (origin skip, filter)
//!                                             ▼
//!                       conflicts ◀── bulk write to target
//!                          │
//!                          ▼
//!                  ConflictResolver → put / skip / record failure
//! ```
//!
//! Batches are processed strictly in enumeration order; document order
//! *within* a batch write is up to the store. Replicated writes carry the
//! source revision, so re-writing an unchanged document is a no-op success
//! and repeating a run against quiesced stores reports the same
//! `docs_written` without duplicating anything.

use crate::change::{FeedMode, Since};
use crate::config::ReplicatorConfig;
use crate::conflict::{ConflictResolver, Resolution};
use crate::error::{ReplicationError, Result, StoreError};
use crate::feed::ChangeFeedReader;
use crate::metrics;
use crate::store::{Document, DocumentStore, WriteOutcome};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Predicate deciding whether a source document is replicated.
pub type FilterFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Origin marker for bidirectional loop prevention.
///
/// Every body this replicator writes gets `field` set to `write`; any
/// source document whose `field` equals `skip` is not replicated (its
/// latest revision originated from the reverse direction).
#[derive(Debug, Clone)]
pub struct OriginTag {
    /// Body field carrying the marker.
    pub field: String,
    /// Label stamped on outgoing writes.
    pub write: String,
    /// Label identifying reverse-direction writes to skip.
    pub skip: String,
}

/// Counters accumulated over one replication run.
///
/// Owned and mutated only by the replicator during the run; read-only to
/// callers afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicationStats {
    /// Documents whose bodies were read from the source (including
    /// filtered and origin-skipped ones).
    pub docs_read: u64,
    /// Documents written to the target.
    pub docs_written: u64,
    /// Documents recorded as write failures.
    pub doc_write_failures: u64,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl ReplicationStats {
    /// Throughput derived from `docs_written / duration`.
    pub fn docs_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.docs_written as f64 / secs
        } else {
            0.0
        }
    }

    /// Fold another run's counters into this accumulator.
    pub fn merge(&mut self, other: &ReplicationStats) {
        self.docs_read += other.docs_read;
        self.docs_written += other.docs_written;
        self.doc_write_failures += other.doc_write_failures;
        self.duration += other.duration;
    }
}

/// One document that could not be written.
#[derive(Debug, Clone)]
pub struct DocumentFailure {
    /// Id of the failed document.
    pub id: String,
    /// Human-readable reason.
    pub error: String,
}

/// Outcome of one replication run. Immutable after return; `Ok` means
/// "ran to completion", not "zero failures" - inspect
/// [`stats`](Self::stats) and [`failures`](Self::failures).
#[derive(Debug, Clone)]
pub struct ReplicationResult {
    /// Counters for the run.
    pub stats: ReplicationStats,
    /// Per-document failures, in the order they occurred.
    pub failures: Vec<DocumentFailure>,
    /// For change-driven runs: the checkpoint to resume from next time.
    pub last_seq: Option<String>,
}

impl ReplicationResult {
    /// Check if every document made it across.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Default)]
struct RunState {
    stats: ReplicationStats,
    failures: Vec<DocumentFailure>,
}

impl RunState {
    fn fail(&mut self, id: String, error: impl Into<String>) {
        let error = error.into();
        warn!(id = %id, error = %error, "Document write failed");
        self.stats.doc_write_failures += 1;
        self.failures.push(DocumentFailure { id, error });
    }
}

/// One-shot/batched unidirectional document copier.
pub struct BatchReplicator<S: DocumentStore, T: DocumentStore> {
    source: Arc<S>,
    target: Arc<T>,
    config: ReplicatorConfig,
    filter: Option<FilterFn>,
    resolver: Option<ConflictResolver>,
    origin: Option<OriginTag>,
    label: String,
}

impl<S: DocumentStore, T: DocumentStore> BatchReplicator<S, T> {
    /// Create a replicator from `source` to `target`.
    pub fn new(source: Arc<S>, target: Arc<T>, config: ReplicatorConfig) -> Self {
        Self {
            source,
            target,
            config,
            filter: None,
            resolver: None,
            origin: None,
            label: "primary".to_string(),
        }
    }

    /// Only replicate documents matching `f`. Non-matching documents count
    /// toward `docs_read` but are not written.
    pub fn with_filter(mut self, f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(f));
        self
    }

    /// Route write conflicts through `resolver`. Without one, each
    /// conflicting document is recorded as a failure and the target
    /// revision is left untouched.
    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Stamp and honor replication-origin markers (bidirectional loop
    /// prevention).
    pub fn with_origin(mut self, origin: OriginTag) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Label used in logs and metrics for this replicator.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Copy every document the source enumerates.
    pub async fn replicate(&self) -> Result<ReplicationResult> {
        self.config.validate()?;
        let started = Instant::now();
        let mut run = RunState::default();

        let mut batch = Vec::with_capacity(self.config.batch_size);
        {
            let mut ids = self.source.document_ids();
            while let Some(id) = ids.next().await {
                batch.push(id.map_err(|e| ReplicationError::store("document_ids", e))?);
                if batch.len() == self.config.batch_size {
                    self.process_batch(&std::mem::take(&mut batch), &mut run).await?;
                }
            }
        }
        if !batch.is_empty() {
            self.process_batch(&batch, &mut run).await?;
        }

        Ok(self.finish(run, started, None))
    }

    /// Copy the documents changed since `since`, as reported by the
    /// source's change feed. The result's `last_seq` is the checkpoint for
    /// the next incremental run.
    ///
    /// Ids are deduplicated keeping first-seen order; a document whose
    /// latest change is a deletion is skipped.
    pub async fn replicate_since(&self, since: Since) -> Result<ReplicationResult> {
        self.config.validate()?;
        let started = Instant::now();

        let mut reader =
            ChangeFeedReader::open(self.source.as_ref(), since.clone(), FeedMode::Normal, false)
                .await?;
        let mut order: Vec<String> = Vec::new();
        let mut latest_deleted: HashMap<String, bool> = HashMap::new();
        while let Some(change) = reader.next().await? {
            if !latest_deleted.contains_key(&change.id) {
                order.push(change.id.clone());
            }
            latest_deleted.insert(change.id, change.deleted);
        }
        let last_seq = reader
            .last_seq()
            .map(str::to_string)
            .or_else(|| match since {
                Since::Beginning => None,
                Since::Seq(s) => Some(s),
            });

        let ids: Vec<String> = order
            .into_iter()
            .filter(|id| {
                let deleted = latest_deleted.get(id).copied().unwrap_or(false);
                if deleted {
                    debug!(id = %id, "Skipping deleted document");
                }
                !deleted
            })
            .collect();

        let mut run = RunState::default();
        for chunk in ids.chunks(self.config.batch_size) {
            self.process_batch(chunk, &mut run).await?;
        }
        Ok(self.finish(run, started, last_seq))
    }

    /// Run the batch pipeline over a caller-provided id list.
    pub async fn replicate_ids(&self, ids: &[String]) -> Result<ReplicationResult> {
        self.config.validate()?;
        let started = Instant::now();
        let mut run = RunState::default();
        for chunk in ids.chunks(self.config.batch_size) {
            self.process_batch(chunk, &mut run).await?;
        }
        Ok(self.finish(run, started, None))
    }

    /// Read, filter, and write one page of documents.
    async fn process_batch(&self, ids: &[String], run: &mut RunState) -> Result<()> {
        let mut docs: Vec<Document> = Vec::with_capacity(ids.len());
        let mut bodies: HashMap<String, Value> = HashMap::with_capacity(ids.len());

        for id in ids {
            let doc = self
                .source
                .get_document(id)
                .await
                .map_err(|e| ReplicationError::store("get_document", e))?;
            let Some(mut doc) = doc else {
                // Disappeared between enumeration and read
                debug!(id = %id, "Source document vanished, skipping");
                continue;
            };
            run.stats.docs_read += 1;

            if let Some(tag) = &self.origin {
                if doc.body.get(tag.field.as_str()).and_then(Value::as_str)
                    == Some(tag.skip.as_str())
                {
                    trace!(id = %id, "Skipping reverse-origin document");
                    continue;
                }
            }

            if let Some(filter) = &self.filter {
                if !filter(&doc.body) {
                    trace!(id = %id, "Filtered out");
                    continue;
                }
            }

            if let Some(tag) = &self.origin {
                if let Some(obj) = doc.body.as_object_mut() {
                    obj.insert(tag.field.clone(), Value::String(tag.write.clone()));
                }
            }

            bodies.insert(doc.id.clone(), doc.body.clone());
            docs.push(doc);
        }

        if docs.is_empty() {
            return Ok(());
        }

        let outcomes = self
            .target
            .bulk_write(docs)
            .await
            .map_err(|e| ReplicationError::store("bulk_write", e))?;

        for (id, outcome) in outcomes {
            match outcome {
                WriteOutcome::Written(_) => run.stats.docs_written += 1,
                WriteOutcome::Conflict {
                    current_rev,
                    current_body,
                } => {
                    metrics::record_conflicts(&self.label, 1);
                    let incoming = match bodies.get(&id) {
                        Some(body) => body,
                        None => {
                            run.fail(id, "conflict outcome for a document not in the batch");
                            continue;
                        }
                    };
                    self.resolve_conflict(id, incoming, &current_rev, &current_body, run)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn resolve_conflict(
        &self,
        id: String,
        incoming: &Value,
        current_rev: &str,
        current_body: &Value,
        run: &mut RunState,
    ) -> Result<()> {
        let Some(resolver) = &self.resolver else {
            run.fail(id, format!("conflict with revision {current_rev}: no resolver configured"));
            return Ok(());
        };
        match resolver.resolve(incoming, current_body) {
            Ok(Resolution::Write(body)) => {
                match self.target.put_document(&id, Some(current_rev), body).await {
                    Ok(new_rev) => {
                        trace!(id = %id, rev = %new_rev, "Conflict resolved in favor of incoming");
                        run.stats.docs_written += 1;
                    }
                    // Transient outage mid-run is unrecoverable for the run
                    Err(e @ StoreError::Unavailable(_)) => {
                        return Err(ReplicationError::store("put_document", e));
                    }
                    Err(e) => run.fail(id, e.to_string()),
                }
            }
            Ok(Resolution::Skip) => {
                trace!(id = %id, "Conflict resolved in favor of target");
            }
            Err(message) => run.fail(id, message),
        }
        Ok(())
    }

    fn finish(&self, run: RunState, started: Instant, last_seq: Option<String>) -> ReplicationResult {
        let mut stats = run.stats;
        stats.duration = started.elapsed();

        metrics::record_docs_read(&self.label, stats.docs_read);
        metrics::record_docs_written(&self.label, stats.docs_written);
        metrics::record_write_failures(&self.label, stats.doc_write_failures);
        metrics::record_replication_duration(&self.label, stats.duration);

        info!(
            label = %self.label,
            docs_read = stats.docs_read,
            docs_written = stats.docs_written,
            failures = stats.doc_write_failures,
            duration_ms = stats.duration.as_millis() as u64,
            "Replication run complete"
        );

        ReplicationResult {
            stats,
            failures: run.failures,
            last_seq,
        }
    }
}
