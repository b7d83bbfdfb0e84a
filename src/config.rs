//! Configuration for listeners, feeds, and replicators.
//!
//! Configuration is passed to the component constructors and can be built
//! programmatically or deserialized from YAML/JSON. Every knob has a
//! default; `validate()` rejects statically invalid values before any I/O.
//!
//! # Quick Start
//!
//! ```rust
//! use docsync::config::{FeedConfig, ReplicatorConfig};
//!
//! let replicator = ReplicatorConfig { batch_size: 50, ..Default::default() };
//! let feed = FeedConfig { buffer_size: 200, ..Default::default() };
//! assert!(replicator.validate().is_ok());
//! assert!(feed.validate().is_ok());
//! ```

use crate::change::FeedMode;
use crate::error::{ReplicationError, Result};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// ReconnectConfig: serde-friendly mirror of resilience::RetryConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Reconnect backoff settings for continuous consumers.
///
/// A serializable mirror of [`RetryConfig`]; convert with
/// [`retry_config()`](Self::retry_config).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt (ms).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Ceiling for the exponential backoff (ms).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Backoff multiplier between attempts.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Optional cap on reconnect attempts. `None` retries forever until
    /// `stop()` is called.
    #[serde(default)]
    pub max_attempts: Option<usize>,
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Fast backoff for tests.
    pub fn for_testing() -> Self {
        Self {
            initial_delay_ms: 5,
            max_delay_ms: 50,
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }

    /// Convert into the runtime retry schedule.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.unwrap_or(usize::MAX),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ListenerConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for a [`ChangesListener`](crate::listener::ChangesListener).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Feed mode for push consumption. `Continuous` runs until `stop()`;
    /// `Normal` reads to the end of the feed and stops cleanly.
    #[serde(default = "default_feed_mode")]
    pub mode: FeedMode,

    /// Whether delivered changes carry full document bodies.
    #[serde(default)]
    pub include_docs: bool,

    /// Reconnect policy after feed interruptions.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_feed_mode() -> FeedMode {
    FeedMode::Continuous
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            mode: FeedMode::Continuous,
            include_docs: false,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ListenerConfig {
    /// Fast-cycling config for tests.
    pub fn for_testing() -> Self {
        Self {
            mode: FeedMode::Continuous,
            include_docs: false,
            reconnect: ReconnectConfig::for_testing(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FeedConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for a [`ChangesFeed`](crate::fanout::ChangesFeed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Capacity of the ring buffer of most recent changes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Whether the feed reconnects after interruptions. When false, an
    /// interruption stops the feed cleanly.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Reconnect policy (used only when `auto_reconnect` is true).
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_buffer_size() -> usize {
    100
}

fn default_true() -> bool {
    true
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            auto_reconnect: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl FeedConfig {
    /// Small buffer, fast backoff for tests.
    pub fn for_testing() -> Self {
        Self {
            buffer_size: 10,
            auto_reconnect: true,
            reconnect: ReconnectConfig::for_testing(),
        }
    }

    /// Reject statically invalid values. Called before any I/O.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(ReplicationError::Config(
                "buffer_size must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicatorConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for a [`BatchReplicator`](crate::replicator::BatchReplicator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Maximum documents per bulk read/write cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    100
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

impl ReplicatorConfig {
    /// Small batches for tests.
    pub fn for_testing() -> Self {
        Self { batch_size: 5 }
    }

    /// Reject statically invalid values. Called before any I/O.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ReplicationError::Config(
                "batch_size must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BidirectionalConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for a
/// [`BidirectionalReplicator`](crate::bidirectional::BidirectionalReplicator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidirectionalConfig {
    /// When true, `start()` runs both directions continuously off change
    /// listeners; when false, passes are driven by `run_once()`.
    #[serde(default)]
    pub continuous: bool,

    /// Per-direction replication settings.
    #[serde(default)]
    pub replicator: ReplicatorConfig,

    /// Listener reconnect policy for continuous mode.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Body field used to mark the replication origin of a write.
    #[serde(default = "default_origin_field")]
    pub origin_field: String,

    /// Origin label stamped on documents written into store B by the
    /// A-to-B direction (and skipped by B-to-A).
    #[serde(default = "default_origin_a")]
    pub origin_a: String,

    /// Origin label stamped on documents written into store A by the
    /// B-to-A direction (and skipped by A-to-B).
    #[serde(default = "default_origin_b")]
    pub origin_b: String,
}

fn default_origin_field() -> String {
    "_replicated_from".to_string()
}

fn default_origin_a() -> String {
    "a".to_string()
}

fn default_origin_b() -> String {
    "b".to_string()
}

impl Default for BidirectionalConfig {
    fn default() -> Self {
        Self {
            continuous: false,
            replicator: ReplicatorConfig::default(),
            reconnect: ReconnectConfig::default(),
            origin_field: default_origin_field(),
            origin_a: default_origin_a(),
            origin_b: default_origin_b(),
        }
    }
}

impl BidirectionalConfig {
    /// Small batches, fast backoff for tests.
    pub fn for_testing() -> Self {
        Self {
            replicator: ReplicatorConfig::for_testing(),
            reconnect: ReconnectConfig::for_testing(),
            ..Default::default()
        }
    }

    /// Reject statically invalid values. Called before any I/O.
    pub fn validate(&self) -> Result<()> {
        self.replicator.validate()?;
        if self.origin_field.is_empty() {
            return Err(ReplicationError::Config(
                "origin_field must not be empty".to_string(),
            ));
        }
        if self.origin_a == self.origin_b {
            return Err(ReplicationError::Config(
                "origin labels must differ between directions".to_string(),
            ));
        }
        Ok(())
    }
}
