// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for change-feed consumption and replication.
//!
//! Errors are split into two layers: [`StoreError`] for failures reported by
//! a [`DocumentStore`](crate::store::DocumentStore), and [`ReplicationError`]
//! for everything the components of this crate surface to callers.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `FeedInterrupted` | Yes | Change-feed connection dropped mid-stream |
//! | `Store` (unavailable) | Yes | Store unreachable, timed out |
//! | `Store` (other) | No | Not-found, revision conflict, backend fault |
//! | `Config` | No | Invalid options, rejected before any I/O |
//! | `InvalidState` | No | Lifecycle violation (e.g. restart after stop) |
//! | `Shutdown` | No | Component is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether an operation
//! should be retried with backoff. Continuous consumers (listeners, feeds)
//! retry transient errors internally; pull-mode calls surface them.
//!
//! Per-document write failures are *not* errors: replication runs accumulate
//! them in [`ReplicationResult`](crate::replicator::ReplicationResult) and
//! always run to completion.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Result type alias for document-store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors reported by a [`DocumentStore`](crate::store::DocumentStore).
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The addressed document does not exist.
    #[error("document not found: {0}")]
    NotFound(String),

    /// A write was rejected because the supplied revision does not match
    /// the store's current revision for the document.
    #[error("revision conflict on {id} (current: {current_rev})")]
    Conflict {
        /// Document id the write addressed.
        id: String,
        /// The revision currently held by the store.
        current_rev: String,
    },

    /// The store is unreachable or timed out. Transient; retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Any other backend fault. Not retryable.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Check if this store error is transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Errors surfaced by the components of this crate.
///
/// Each variant includes context about where the error occurred.
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// should be retried.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The change-feed connection dropped mid-stream.
    ///
    /// Carries the sequence token of the last successfully delivered
    /// change so the consumer can resume with `since = last_seq`.
    /// Retryable; continuous consumers reconnect automatically.
    #[error("change feed interrupted (last_seq: {last_seq:?})")]
    FeedInterrupted {
        /// Sequence of the last change delivered before the drop, if any.
        last_seq: Option<String>,
    },

    /// A document-store operation failed.
    ///
    /// Retryable only when the underlying [`StoreError`] is transient.
    #[error("store error ({operation}): {source}")]
    Store {
        /// The store operation that failed (e.g. `"bulk_write"`).
        operation: String,
        #[source]
        source: StoreError,
    },

    /// Invalid or missing configuration.
    ///
    /// Raised before any network activity. Not retryable.
    #[error("configuration error: {0}")]
    Config(String),

    /// Lifecycle state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g. calling `start()` on a stopped listener).
    /// Not retryable - indicates a bug in the caller.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Wrap a [`StoreError`] with the name of the operation that failed.
    pub fn store(operation: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            operation: operation.into(),
            source,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::FeedInterrupted { .. } => true,
            Self::Store { source, .. } => source.is_transient(),
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// The resume point carried by a feed interruption, if this is one.
    pub fn interrupted_at(&self) -> Option<&str> {
        match self {
            Self::FeedInterrupted { last_seq } => last_seq.as_deref(),
            _ => None,
        }
    }
}
