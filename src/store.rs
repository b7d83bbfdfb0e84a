// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document-store integration trait.
//!
//! Defines the interface this crate needs from a document store. Every
//! component (feed reader, listeners, replicators) consumes a store through
//! this trait, which keeps the crate decoupled from any concrete backend
//! and makes testing with in-memory stores trivial.
//!
//! Connections behind an implementation are owned by the caller: components
//! only issue reads and writes, never close or reconfigure the store.
//!
//! # Example
//!
//! ```rust,no_run
//! use docsync::store::{BoxFuture, ChangeStream, Document, DocumentStore, WriteOutcome};
//! use docsync::change::{FeedMode, Since};
//! use docsync::error::StoreResult;
//! use futures::stream::BoxStream;
//! use serde_json::Value;
//!
//! struct MyBackend { /* ... */ }
//!
//! impl DocumentStore for MyBackend {
//!     fn get_document(&self, _id: &str) -> BoxFuture<'_, Option<Document>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//!
//!     fn put_document(&self, id: &str, _rev: Option<&str>, _body: Value) -> BoxFuture<'_, String> {
//!         let _id = id.to_string();
//!         Box::pin(async move { Ok("1-0000000000000000".to_string()) })
//!     }
//!
//!     fn bulk_write(&self, docs: Vec<Document>) -> BoxFuture<'_, Vec<(String, WriteOutcome)>> {
//!         Box::pin(async move {
//!             Ok(docs
//!                 .into_iter()
//!                 .map(|d| (d.id, WriteOutcome::Written("1-0".to_string())))
//!                 .collect())
//!         })
//!     }
//!
//!     fn document_ids(&self) -> BoxStream<'_, StoreResult<String>> {
//!         Box::pin(futures::stream::empty())
//!     }
//!
//!     fn open_change_feed(
//!         &self,
//!         _since: Since,
//!         _mode: FeedMode,
//!         _include_docs: bool,
//!     ) -> BoxFuture<'_, ChangeStream> {
//!         Box::pin(async move { Ok(Box::pin(futures::stream::empty()) as _) })
//!     }
//!
//!     fn ping(&self) -> BoxFuture<'_, bool> {
//!         Box::pin(async move { Ok(true) })
//!     }
//! }
//! ```

use crate::change::{Change, FeedMode, Since};
use crate::error::StoreResult;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Handle for an open change feed: a stream of change records.
///
/// A `Normal` feed ends when history is exhausted; a `Continuous` feed has
/// no natural end. An `Err` item, or a continuous stream ending, means the
/// connection dropped.
pub type ChangeStream = Pin<Box<dyn futures::Stream<Item = StoreResult<Change>> + Send>>;

/// A document as read from or written to a store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Document id.
    pub id: String,
    /// Revision token. `None` on a write means "create new".
    pub rev: Option<String>,
    /// JSON body.
    pub body: Value,
}

impl Document {
    /// Build a document with no revision.
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            rev: None,
            body,
        }
    }

    /// Build a document carrying an explicit revision.
    pub fn with_rev(id: impl Into<String>, rev: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            rev: Some(rev.into()),
            body,
        }
    }
}

/// Per-document outcome of a [`DocumentStore::bulk_write`].
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    /// The write was accepted; carries the revision now current on the
    /// store (for a replicated write this is the revision the document
    /// arrived with).
    Written(String),
    /// The write was rejected: the store holds a different revision.
    /// Carries the current revision and body so a conflict policy can
    /// decide without a second read.
    Conflict {
        current_rev: String,
        current_body: Value,
    },
}

impl WriteOutcome {
    /// Check if the write was accepted.
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written(_))
    }
}

/// Trait defining what this crate needs from a document store.
///
/// All methods return boxed futures so the trait stays object-safe and
/// implementations remain free to be sync-backed or network-backed.
pub trait DocumentStore: Send + Sync + 'static {
    /// Fetch a document by id. `Ok(None)` when it does not exist.
    fn get_document(&self, id: &str) -> BoxFuture<'_, Option<Document>>;

    /// Write a document body, returning the new revision.
    ///
    /// Fails with [`StoreError::Conflict`](crate::error::StoreError::Conflict)
    /// when `rev` does not match the store's current revision.
    fn put_document(&self, id: &str, rev: Option<&str>, body: Value) -> BoxFuture<'_, String>;

    /// Write a batch of documents, reporting a per-document outcome.
    ///
    /// Document order within the batch is unspecified; the store may
    /// reorder. A rejected document is reported as
    /// [`WriteOutcome::Conflict`], never as a stream-level error.
    fn bulk_write(&self, docs: Vec<Document>) -> BoxFuture<'_, Vec<(String, WriteOutcome)>>;

    /// Lazily enumerate all (non-deleted) document ids. Finite; calling
    /// again restarts the enumeration.
    fn document_ids(&self) -> BoxStream<'_, StoreResult<String>>;

    /// Open a change feed from the given resume point.
    fn open_change_feed(
        &self,
        since: Since,
        mode: FeedMode,
        include_docs: bool,
    ) -> BoxFuture<'_, ChangeStream>;

    /// Reachability check.
    fn ping(&self) -> BoxFuture<'_, bool>;
}

/// A no-op store for wiring tests and standalone experiments.
///
/// Holds nothing, accepts every write, and serves empty feeds.
#[derive(Clone, Default)]
pub struct NullDocumentStore;

impl DocumentStore for NullDocumentStore {
    fn get_document(&self, id: &str) -> BoxFuture<'_, Option<Document>> {
        tracing::trace!(id = %id, "null store: get_document");
        Box::pin(async move { Ok(None) })
    }

    fn put_document(&self, id: &str, _rev: Option<&str>, body: Value) -> BoxFuture<'_, String> {
        tracing::debug!(id = %id, bytes = body.to_string().len(), "null store: would put document");
        Box::pin(async move { Ok("1-0000000000000000".to_string()) })
    }

    fn bulk_write(&self, docs: Vec<Document>) -> BoxFuture<'_, Vec<(String, WriteOutcome)>> {
        Box::pin(async move {
            Ok(docs
                .into_iter()
                .map(|d| (d.id, WriteOutcome::Written("1-0000000000000000".to_string())))
                .collect())
        })
    }

    fn document_ids(&self) -> BoxStream<'_, StoreResult<String>> {
        Box::pin(futures::stream::empty())
    }

    fn open_change_feed(
        &self,
        _since: Since,
        _mode: FeedMode,
        _include_docs: bool,
    ) -> BoxFuture<'_, ChangeStream> {
        Box::pin(async move { Ok(Box::pin(futures::stream::empty()) as ChangeStream) })
    }

    fn ping(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { Ok(true) })
    }
}
