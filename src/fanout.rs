//! Multi-subscriber change feed with a bounded replay buffer.
//!
//! [`ChangesFeed`] reuses [`ChangesListener`] push consumption internally
//! and adds two things on top:
//!
//! - a fixed-capacity ring buffer of the most recent changes, readable at
//!   any time via a snapshot copy ([`get_buffer`](ChangesFeed::get_buffer));
//! - any number of independent subscribers, registered before or after
//!   `start()`, each invoked for every change in registration order.
//!
//! Dispatch is sequential: subscribers never run concurrently with each
//! other or with themselves. The subscriber list is copied out of the lock
//! before invocation, so a callback may subscribe or unsubscribe without
//! deadlocking; buffer reads never block on network I/O.

use crate::change::{Change, FeedMode, Since};
use crate::config::{FeedConfig, ListenerConfig, ReconnectConfig};
use crate::error::{ReplicationError, Result};
use crate::listener::{ChangeCallback, ChangesListener};
use crate::metrics;
use crate::store::DocumentStore;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Handle returned by [`ChangesFeed::subscribe`]; pass it back to
/// [`ChangesFeed::unsubscribe`] to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

/// Feed lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedPhase {
    /// Constructed, not yet started.
    Created,
    /// Consuming the feed.
    Running,
    /// Terminal. A fresh instance is needed to consume again.
    Stopped,
}

struct FanoutInner {
    buffer: VecDeque<Change>,
    subscribers: Vec<(u64, ChangeCallback)>,
    next_id: u64,
}

struct FanoutState {
    capacity: usize,
    inner: StdMutex<FanoutInner>,
}

impl FanoutState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: StdMutex::new(FanoutInner {
                buffer: VecDeque::with_capacity(capacity),
                subscribers: Vec::new(),
                next_id: 0,
            }),
        }
    }

    fn subscribe(&self, cb: ChangeCallback) -> Subscription {
        let mut inner = self.inner.lock().expect("fanout lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push((id, cb));
        Subscription(id)
    }

    fn unsubscribe(&self, sub: Subscription) -> bool {
        let mut inner = self.inner.lock().expect("fanout lock poisoned");
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(id, _)| *id != sub.0);
        inner.subscribers.len() != before
    }

    fn buffer_snapshot(&self) -> Vec<Change> {
        let inner = self.inner.lock().expect("fanout lock poisoned");
        inner.buffer.iter().cloned().collect()
    }

    fn dispatch(&self, change: Change) {
        // Buffer the change and copy the subscriber list out of the lock;
        // callbacks run unlocked so they can (un)subscribe freely.
        let subscribers: Vec<ChangeCallback> = {
            let mut inner = self.inner.lock().expect("fanout lock poisoned");
            if inner.buffer.len() == self.capacity {
                inner.buffer.pop_front();
                metrics::record_buffer_evicted();
            }
            inner.buffer.push_back(change.clone());
            inner.subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        metrics::record_fanout_dispatch(subscribers.len());
        for cb in subscribers {
            cb(change.clone());
        }
    }
}

/// Fan-out manager over a store's change feed.
pub struct ChangesFeed<S: DocumentStore> {
    store: Arc<S>,
    config: FeedConfig,
    since: Since,
    fanout: Arc<FanoutState>,
    phase: StdMutex<FeedPhase>,
    listener: Mutex<Option<ChangesListener<S>>>,
}

impl<S: DocumentStore> ChangesFeed<S> {
    /// Create a feed manager over `store`.
    pub fn new(store: Arc<S>, config: FeedConfig) -> Self {
        let capacity = config.buffer_size.max(1);
        Self {
            store,
            config,
            since: Since::Beginning,
            fanout: Arc::new(FanoutState::new(capacity)),
            phase: StdMutex::new(FeedPhase::Created),
            listener: Mutex::new(None),
        }
    }

    /// Set the resume point consumption starts from.
    pub fn with_since(mut self, since: Since) -> Self {
        self.since = since;
        self
    }

    /// Register a subscriber. Subscribers registered after `start()` see
    /// only changes dispatched from then on.
    pub fn subscribe(&self, f: impl Fn(Change) + Send + Sync + 'static) -> Subscription {
        self.fanout.subscribe(Arc::new(f))
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, sub: Subscription) -> bool {
        self.fanout.unsubscribe(sub)
    }

    /// Snapshot of the current buffer contents, oldest first. The copy is
    /// detached: it never mutates under the caller.
    pub fn get_buffer(&self) -> Vec<Change> {
        self.fanout.buffer_snapshot()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> FeedPhase {
        *self.phase.lock().expect("phase lock poisoned")
    }

    /// Begin push consumption.
    ///
    /// Fails with `InvalidState` unless the feed is freshly created; a
    /// stopped feed cannot be restarted.
    pub async fn start(&self, mode: FeedMode, include_docs: bool) -> Result<()> {
        self.config.validate()?;

        let mut listener_guard = self.listener.lock().await;
        {
            let mut phase = self.phase.lock().expect("phase lock poisoned");
            if *phase != FeedPhase::Created {
                return Err(ReplicationError::InvalidState {
                    expected: "Created".to_string(),
                    actual: format!("{:?}", *phase),
                });
            }
            *phase = FeedPhase::Running;
        }

        let reconnect = if self.config.auto_reconnect {
            self.config.reconnect.clone()
        } else {
            // First interruption is terminal.
            ReconnectConfig {
                max_attempts: Some(0),
                ..self.config.reconnect.clone()
            }
        };
        let listener_config = ListenerConfig {
            mode,
            include_docs,
            reconnect,
        };

        info!(
            ?mode,
            include_docs,
            buffer_size = self.config.buffer_size,
            auto_reconnect = self.config.auto_reconnect,
            "Starting changes feed"
        );

        let fanout = Arc::clone(&self.fanout);
        let listener = ChangesListener::new(Arc::clone(&self.store), listener_config)
            .with_since(self.since.clone())
            .on_change(move |change| fanout.dispatch(change))
            .on_error(|e| warn!(error = %e, "Changes feed interrupted"));
        listener.start().await?;
        *listener_guard = Some(listener);
        Ok(())
    }

    /// Stop consumption. Idempotent; when this returns, no subscriber will
    /// be invoked again.
    pub async fn stop(&self) {
        let listener = {
            let mut guard = self.listener.lock().await;
            *self.phase.lock().expect("phase lock poisoned") = FeedPhase::Stopped;
            guard.take()
        };
        if let Some(listener) = listener {
            listener.stop().await;
        }
        debug!("Changes feed stopped");
    }
}
