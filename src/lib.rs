//! # docsync
//!
//! Change-feed consumption and batched document replication between
//! document stores.
//!
//! ## Architecture
//!
//! The crate observes the mutation stream of a source store and propagates
//! documents to one or more targets, optionally in both directions, with
//! pluggable conflict resolution:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               docsync                                │
//! │                                                                      │
//! │  ┌──────────────────┐   ┌─────────────────┐   ┌───────────────────┐  │
//! │  │ ChangeFeedReader │──▶│ ChangesListener │──▶│ ChangesFeed       │  │
//! │  │ (resumable)      │   │ (push/pull)     │   │ (buffer + fan-out)│  │
//! │  └──────────────────┘   └─────────────────┘   └───────────────────┘  │
//! │            │                     │                                   │
//! │            ▼                     ▼                                   │
//! │  ┌──────────────────┐   ┌───────────────────────────────────────┐    │
//! │  │ BatchReplicator  │◀──│ BidirectionalReplicator               │    │
//! │  │ (+ConflictResolver)  │ (paired passes / continuous, origin   │    │
//! │  └──────────────────┘   │  tagging for loop prevention)         │    │
//! │                         └───────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//!                     DocumentStore trait (caller-provided)
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use docsync::{BatchReplicator, MemoryDocumentStore, ReplicatorConfig};
//! use docsync::store::DocumentStore;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let source = Arc::new(MemoryDocumentStore::new());
//!     let target = Arc::new(MemoryDocumentStore::new());
//!     source.put_document("doc:1", None, json!({"hello": "world"})).await.unwrap();
//!
//!     let replicator = BatchReplicator::new(source, target, ReplicatorConfig::default());
//!     let result = replicator.replicate().await.unwrap();
//!     assert_eq!(result.stats.docs_written, 1);
//! }
//! ```

pub mod bidirectional;
pub mod change;
pub mod config;
pub mod conflict;
pub mod error;
pub mod fanout;
pub mod feed;
pub mod listener;
pub mod memory;
pub mod metrics;
pub mod replicator;
pub mod resilience;
pub mod store;

// Re-exports for convenience
pub use bidirectional::{BidirectionalPass, BidirectionalReplicator, BidirectionalStats, EngineState};
pub use change::{Change, ChangesPage, FeedMode, Since};
pub use config::{BidirectionalConfig, FeedConfig, ListenerConfig, ReconnectConfig, ReplicatorConfig};
pub use conflict::{ConflictResolver, ConflictStrategy, Resolution};
pub use error::{ReplicationError, Result, StoreError};
pub use fanout::{ChangesFeed, FeedPhase, Subscription};
pub use feed::ChangeFeedReader;
pub use listener::{ChangesListener, ListenerState};
pub use memory::MemoryDocumentStore;
pub use replicator::{
    BatchReplicator, DocumentFailure, OriginTag, ReplicationResult, ReplicationStats,
};
pub use resilience::RetryConfig;
pub use store::{Document, DocumentStore, NullDocumentStore, WriteOutcome};
