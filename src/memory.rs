//! In-memory document store.
//!
//! A complete [`DocumentStore`] implementation backed by process memory,
//! used by this crate's tests and useful as a standalone backend for
//! experiments. Semantics mirror a revisioned document database:
//!
//! - Revisions are `generation-digest` tokens; the digest is a SHA-256
//!   prefix of the body.
//! - Every mutation appends to an ordered change log with a monotonically
//!   increasing sequence counter. The log is not collapsed per document:
//!   a feed replays every recorded mutation after the resume point.
//! - Continuous feeds are served from a broadcast channel, so changes made
//!   after the feed was opened arrive live.
//! - A bulk write of a document that carries an explicit revision stores it
//!   under exactly that revision (replicated writes preserve the source
//!   revision); re-writing an identical revision is a no-op success.
//!
//! # Failure Injection
//!
//! For tests: [`set_unavailable`](MemoryDocumentStore::set_unavailable)
//! makes every operation fail with `StoreError::Unavailable`, and
//! [`interrupt_feeds`](MemoryDocumentStore::interrupt_feeds) severs all
//! open continuous feeds, as a dropped connection would.

use crate::change::{Change, FeedMode, Since};
use crate::error::{StoreError, StoreResult};
use crate::store::{BoxFuture, ChangeStream, Document, DocumentStore, WriteOutcome};
use futures::stream::BoxStream;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;

/// Capacity of the live-feed broadcast channel. A subscriber that falls
/// further behind than this sees the feed as interrupted and must resume
/// from its last sequence.
const LIVE_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct StoredDoc {
    rev: String,
    body: Value,
    deleted: bool,
}

#[derive(Debug, Clone)]
struct LogEntry {
    seq: u64,
    id: String,
    rev: String,
    deleted: bool,
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, StoredDoc>,
    log: Vec<LogEntry>,
    seq: u64,
}

/// In-memory [`DocumentStore`] with revisions, an ordered change log, and
/// live continuous feeds.
pub struct MemoryDocumentStore {
    inner: Arc<RwLock<Inner>>,
    live: Mutex<broadcast::Sender<Change>>,
    unavailable: AtomicBool,
}

impl MemoryDocumentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LIVE_FEED_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            live: Mutex::new(tx),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Toggle failure injection: when unavailable, every operation fails
    /// with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Sever all open continuous feeds, as a dropped connection would.
    /// Feeds opened afterwards work normally.
    pub fn interrupt_feeds(&self) {
        let (tx, _) = broadcast::channel(LIVE_FEED_CAPACITY);
        *self.live.lock().expect("live feed lock poisoned") = tx;
    }

    /// Number of live (non-deleted) documents.
    pub fn document_count(&self) -> usize {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.docs.values().filter(|d| !d.deleted).count()
    }

    /// Current head of the change log, as a sequence token.
    pub fn last_seq(&self) -> String {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.seq.to_string()
    }

    /// Delete a document. `rev` must match the current revision.
    ///
    /// Deletions appear in the change feed with `deleted = true`; the
    /// document id stops appearing in [`DocumentStore::document_ids`].
    pub fn delete_document(&self, id: &str, rev: &str) -> StoreResult<String> {
        self.check_available()?;
        let change = {
            let mut inner = self.inner.write().expect("store lock poisoned");
            let doc = match inner.docs.get(id) {
                Some(d) if !d.deleted => d.clone(),
                _ => return Err(StoreError::NotFound(id.to_string())),
            };
            if doc.rev != rev {
                return Err(StoreError::Conflict {
                    id: id.to_string(),
                    current_rev: doc.rev,
                });
            }
            let new_rev = revision(generation(&doc.rev) + 1, &Value::Null);
            inner.docs.insert(
                id.to_string(),
                StoredDoc {
                    rev: new_rev.clone(),
                    body: Value::Null,
                    deleted: true,
                },
            );
            record(&mut inner, id, &new_rev, true)
        };
        let rev = change.rev.clone();
        self.publish(change);
        Ok(rev)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn publish(&self, change: Change) {
        // No receivers is fine; the send result only reports that.
        let _ = self
            .live
            .lock()
            .expect("live feed lock poisoned")
            .send(change);
    }

    fn snapshot_since(&self, since: &Since, include_docs: bool) -> Vec<Change> {
        let floor = parse_seq(since.as_token());
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .log
            .iter()
            .filter(|e| e.seq > floor)
            .map(|e| {
                let doc = if include_docs && !e.deleted {
                    inner.docs.get(&e.id).map(|d| d.body.clone())
                } else {
                    None
                };
                Change {
                    seq: e.seq.to_string(),
                    id: e.id.clone(),
                    rev: e.rev.clone(),
                    deleted: e.deleted,
                    doc,
                }
            })
            .collect()
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_seq(token: &str) -> u64 {
    // Tokens are opaque to consumers but numeric here; anything foreign
    // reads as the beginning.
    token.parse().unwrap_or(0)
}

fn generation(rev: &str) -> u64 {
    rev.split('-').next().and_then(|g| g.parse().ok()).unwrap_or(0)
}

fn revision(gen: u64, body: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.to_string().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("{gen}-{hex}")
}

fn record(inner: &mut Inner, id: &str, rev: &str, deleted: bool) -> Change {
    inner.seq += 1;
    let entry = LogEntry {
        seq: inner.seq,
        id: id.to_string(),
        rev: rev.to_string(),
        deleted,
    };
    inner.log.push(entry);
    let doc = if deleted {
        None
    } else {
        inner.docs.get(id).map(|d| d.body.clone())
    };
    Change {
        seq: inner.seq.to_string(),
        id: id.to_string(),
        rev: rev.to_string(),
        deleted,
        doc,
    }
}

/// State threaded through the continuous-feed stream.
struct FeedState {
    pending: std::vec::IntoIter<Change>,
    rx: broadcast::Receiver<Change>,
    last: u64,
    include_docs: bool,
}

impl DocumentStore for MemoryDocumentStore {
    fn get_document(&self, id: &str) -> BoxFuture<'_, Option<Document>> {
        let result = self.check_available().map(|()| {
            let inner = self.inner.read().expect("store lock poisoned");
            inner.docs.get(id).filter(|d| !d.deleted).map(|d| {
                Document::with_rev(id, d.rev.clone(), d.body.clone())
            })
        });
        Box::pin(async move { result })
    }

    fn put_document(&self, id: &str, rev: Option<&str>, body: Value) -> BoxFuture<'_, String> {
        let result = self.check_available().and_then(|()| {
            let change = {
                let mut inner = self.inner.write().expect("store lock poisoned");
                let current = inner.docs.get(id).filter(|d| !d.deleted).cloned();
                let gen = match (&current, rev) {
                    (Some(doc), Some(expected)) if doc.rev == expected => generation(&doc.rev) + 1,
                    (Some(doc), _) => {
                        return Err(StoreError::Conflict {
                            id: id.to_string(),
                            current_rev: doc.rev.clone(),
                        })
                    }
                    (None, Some(_)) => return Err(StoreError::NotFound(id.to_string())),
                    (None, None) => {
                        // Recreating a deleted document continues its line.
                        inner
                            .docs
                            .get(id)
                            .map(|d| generation(&d.rev) + 1)
                            .unwrap_or(1)
                    }
                };
                let new_rev = revision(gen, &body);
                inner.docs.insert(
                    id.to_string(),
                    StoredDoc {
                        rev: new_rev.clone(),
                        body,
                        deleted: false,
                    },
                );
                record(&mut inner, id, &new_rev, false)
            };
            let rev = change.rev.clone();
            self.publish(change);
            Ok(rev)
        });
        Box::pin(async move { result })
    }

    fn bulk_write(&self, docs: Vec<Document>) -> BoxFuture<'_, Vec<(String, WriteOutcome)>> {
        let result = self.check_available().map(|()| {
            let mut outcomes = Vec::with_capacity(docs.len());
            let mut published = Vec::new();
            {
                let mut inner = self.inner.write().expect("store lock poisoned");
                for doc in docs {
                    let current = inner.docs.get(&doc.id).filter(|d| !d.deleted).cloned();
                    let outcome = match current {
                        Some(existing) => match doc.rev.as_deref() {
                            // Same revision already present: idempotent no-op.
                            Some(rev) if rev == existing.rev => {
                                WriteOutcome::Written(existing.rev)
                            }
                            _ => WriteOutcome::Conflict {
                                current_rev: existing.rev,
                                current_body: existing.body,
                            },
                        },
                        None => {
                            let rev = doc
                                .rev
                                .clone()
                                .unwrap_or_else(|| revision(1, &doc.body));
                            inner.docs.insert(
                                doc.id.clone(),
                                StoredDoc {
                                    rev: rev.clone(),
                                    body: doc.body,
                                    deleted: false,
                                },
                            );
                            published.push(record(&mut inner, &doc.id, &rev, false));
                            WriteOutcome::Written(rev)
                        }
                    };
                    outcomes.push((doc.id, outcome));
                }
            }
            for change in published {
                self.publish(change);
            }
            outcomes
        });
        Box::pin(async move { result })
    }

    fn document_ids(&self) -> BoxStream<'_, StoreResult<String>> {
        match self.check_available() {
            Err(e) => Box::pin(futures::stream::iter(vec![Err(e)])),
            Ok(()) => {
                let inner = self.inner.read().expect("store lock poisoned");
                let ids: Vec<_> = inner
                    .docs
                    .iter()
                    .filter(|(_, d)| !d.deleted)
                    .map(|(id, _)| Ok(id.clone()))
                    .collect();
                Box::pin(futures::stream::iter(ids))
            }
        }
    }

    fn open_change_feed(
        &self,
        since: Since,
        mode: FeedMode,
        include_docs: bool,
    ) -> BoxFuture<'_, ChangeStream> {
        let result = self.check_available().map(|()| {
            // Subscribe before snapshotting so nothing published in between
            // is missed; duplicates are dropped by the sequence filter.
            let rx = self
                .live
                .lock()
                .expect("live feed lock poisoned")
                .subscribe();
            let pending = self.snapshot_since(&since, include_docs);
            match mode {
                FeedMode::Normal => {
                    Box::pin(futures::stream::iter(pending.into_iter().map(Ok))) as ChangeStream
                }
                FeedMode::Continuous => {
                    let state = FeedState {
                        pending: pending.into_iter(),
                        rx,
                        last: parse_seq(since.as_token()),
                        include_docs,
                    };
                    Box::pin(futures::stream::unfold(state, |mut st| async move {
                        if let Some(change) = st.pending.next() {
                            st.last = parse_seq(&change.seq);
                            return Some((Ok(change), st));
                        }
                        loop {
                            match st.rx.recv().await {
                                Ok(change) if parse_seq(&change.seq) <= st.last => continue,
                                Ok(mut change) => {
                                    st.last = parse_seq(&change.seq);
                                    if !st.include_docs {
                                        change.doc = None;
                                    }
                                    return Some((Ok(change), st));
                                }
                                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                    return Some((
                                        Err(StoreError::Unavailable(format!(
                                            "change feed lagged by {skipped} events"
                                        ))),
                                        st,
                                    ));
                                }
                                // Sender replaced or dropped: the connection is gone.
                                Err(broadcast::error::RecvError::Closed) => return None,
                            }
                        }
                    })) as ChangeStream
                }
            }
        });
        Box::pin(async move { result })
    }

    fn ping(&self) -> BoxFuture<'_, bool> {
        let up = !self.unavailable.load(Ordering::SeqCst);
        Box::pin(async move { Ok(up) })
    }
}
