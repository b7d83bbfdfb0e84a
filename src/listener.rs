//! Background change consumption with callback dispatch.
//!
//! [`ChangesListener`] wraps a [`ChangeFeedReader`] with two callback
//! slots and two usage modes:
//!
//! - **Pull**: [`get_changes`](ChangesListener::get_changes) reads a finite
//!   page of changes with no background activity.
//! - **Push**: [`start`](ChangesListener::start) spawns one background task
//!   that reads the feed and invokes `on_change` for each record, in
//!   sequence order, one at a time. [`stop`](ChangesListener::stop) signals
//!   cancellation and waits for the task, so no callback fires after it
//!   returns.
//!
//! # Reconnection
//!
//! A feed interruption invokes `on_error` (advisory - the listener keeps
//! running) and reconnects from the last acknowledged sequence with
//! exponential backoff per the configured
//! [`ReconnectConfig`](crate::config::ReconnectConfig). Attempts are
//! unbounded unless a cap is configured; `stop()` exits the loop promptly
//! at any point.
//!
//! # Lifecycle
//!
//! `Created → Running → Stopped`, one way. A stopped listener cannot be
//! restarted - construct a fresh one, which also forces the caller to pick
//! an explicit resume point instead of silently reviving a stale cursor.

use crate::change::{Change, ChangesPage, FeedMode, Since};
use crate::config::ListenerConfig;
use crate::error::{ReplicationError, Result};
use crate::feed::ChangeFeedReader;
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::store::DocumentStore;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback invoked for each delivered change.
pub type ChangeCallback = Arc<dyn Fn(Change) + Send + Sync>;

/// Callback invoked when the feed errors. Advisory only.
pub type ErrorCallback = Arc<dyn Fn(&ReplicationError) + Send + Sync>;

/// Listener lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Constructed, not yet started.
    Created,
    /// Background task consuming the feed.
    Running,
    /// Terminal. A fresh instance is needed to listen again.
    Stopped,
}

/// Background consumer of a store's change feed.
pub struct ChangesListener<S: DocumentStore> {
    store: Arc<S>,
    config: ListenerConfig,
    since: Since,
    on_change: Option<ChangeCallback>,
    on_error: Option<ErrorCallback>,
    state_tx: watch::Sender<ListenerState>,
    state_rx: watch::Receiver<ListenerState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    last_seq: Arc<StdMutex<Option<String>>>,
}

impl<S: DocumentStore> ChangesListener<S> {
    /// Create a listener over `store`. Callbacks are registered with the
    /// builder methods before [`start`](Self::start).
    pub fn new(store: Arc<S>, config: ListenerConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ListenerState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            config,
            since: Since::Beginning,
            on_change: None,
            on_error: None,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            handle: Mutex::new(None),
            last_seq: Arc::new(StdMutex::new(None)),
        }
    }

    /// Set the resume point push consumption starts from.
    pub fn with_since(mut self, since: Since) -> Self {
        self.since = since;
        self
    }

    /// Register the change callback.
    pub fn on_change(mut self, f: impl Fn(Change) + Send + Sync + 'static) -> Self {
        self.on_change = Some(Arc::new(f));
        self
    }

    /// Register the error callback.
    pub fn on_error(mut self, f: impl Fn(&ReplicationError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ListenerState {
        *self.state_rx.borrow()
    }

    /// Check if the background task is running.
    pub fn is_running(&self) -> bool {
        self.state() == ListenerState::Running
    }

    /// Sequence of the last change delivered by push consumption.
    pub fn last_seq(&self) -> Option<String> {
        self.last_seq.lock().expect("last_seq lock poisoned").clone()
    }

    /// Pull a finite page of changes. No background activity; transient
    /// store errors are surfaced to the caller.
    pub async fn get_changes(&self, since: Since, limit: usize) -> Result<ChangesPage> {
        let mut reader = ChangeFeedReader::open(
            self.store.as_ref(),
            since.clone(),
            FeedMode::Normal,
            self.config.include_docs,
        )
        .await?;

        let mut results = Vec::new();
        while results.len() < limit {
            match reader.next().await? {
                Some(change) => results.push(change),
                None => break,
            }
        }
        metrics::record_changes_delivered(results.len());

        let last_seq = results
            .last()
            .map(|c| c.seq.clone())
            .unwrap_or_else(|| since.as_token().to_string());
        Ok(ChangesPage { results, last_seq })
    }

    /// Launch the background consumption task.
    ///
    /// Fails with `Config` if no `on_change` is registered, and with
    /// `InvalidState` unless the listener is freshly created.
    pub async fn start(&self) -> Result<()> {
        let on_change = self
            .on_change
            .clone()
            .ok_or_else(|| ReplicationError::Config("on_change callback not registered".into()))?;

        let mut handle_guard = self.handle.lock().await;
        if self.state() != ListenerState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        let _ = self.state_tx.send(ListenerState::Running);
        metrics::set_consumer_state("listener", "Running");
        info!(mode = ?self.config.mode, since = %self.since, "Starting changes listener");

        let store = Arc::clone(&self.store);
        let mode = self.config.mode;
        let include_docs = self.config.include_docs;
        let retry = self.config.reconnect.retry_config();
        let since = self.since.clone();
        let on_error = self.on_error.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        let state_tx = self.state_tx.clone();
        let last_seq = Arc::clone(&self.last_seq);

        *handle_guard = Some(tokio::spawn(async move {
            run_loop(
                store, mode, include_docs, retry, since, on_change, on_error, shutdown_rx,
                state_tx, last_seq,
            )
            .await;
        }));
        Ok(())
    }

    /// Stop push consumption.
    ///
    /// Idempotent. When this returns, the background task has exited and no
    /// further callback will be invoked.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().await.take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Listener task panicked during shutdown");
                }
                let _ = self.state_tx.send(ListenerState::Stopped);
            }
            None => {
                // Either never started, or another caller owns the join.
                if self.state() == ListenerState::Created {
                    let _ = self.state_tx.send(ListenerState::Stopped);
                    return;
                }
                let mut rx = self.state_rx.clone();
                while *rx.borrow() == ListenerState::Running {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            }
        }
        metrics::set_consumer_state("listener", "Stopped");
    }
}

/// Sleep for `delay`, returning early (false) if shutdown is signaled.
async fn backoff_or_shutdown(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => return true,
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return false;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop<S: DocumentStore>(
    store: Arc<S>,
    mode: FeedMode,
    include_docs: bool,
    retry: RetryConfig,
    mut since: Since,
    on_change: ChangeCallback,
    on_error: Option<ErrorCallback>,
    mut shutdown_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<ListenerState>,
    last_seq: Arc<StdMutex<Option<String>>>,
) {
    let mut attempt: usize = 0;

    'outer: while !*shutdown_rx.borrow() {
        let opened = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break 'outer;
                }
                continue 'outer;
            }
            r = ChangeFeedReader::open(store.as_ref(), since.clone(), mode, include_docs) => r,
        };

        let mut reader = match opened {
            Ok(reader) => reader,
            Err(e) => {
                warn!(error = %e, "Failed to open change feed");
                if let Some(cb) = &on_error {
                    cb(&e);
                }
                attempt += 1;
                if !retry.allows_attempt(attempt) {
                    warn!(attempt, "Reconnect attempts exhausted, stopping listener");
                    break 'outer;
                }
                metrics::record_reconnect_attempt();
                if !backoff_or_shutdown(&mut shutdown_rx, retry.delay_for_attempt(attempt)).await {
                    break 'outer;
                }
                continue 'outer;
            }
        };

        loop {
            let item = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break 'outer;
                    }
                    continue;
                }
                item = reader.next() => item,
            };

            match item {
                Ok(Some(change)) => {
                    attempt = 0;
                    *last_seq.lock().expect("last_seq lock poisoned") = Some(change.seq.clone());
                    since = Since::Seq(change.seq.clone());
                    metrics::record_changes_delivered(1);
                    on_change(change);
                }
                Ok(None) => {
                    // Natural end of a normal-mode feed.
                    debug!(since = %since, "Change feed reached its end");
                    break 'outer;
                }
                Err(e) => {
                    metrics::record_feed_interrupted();
                    if let Some(seq) = e.interrupted_at() {
                        since = Since::seq(seq);
                    }
                    warn!(error = %e, resume = %since, "Change feed interrupted");
                    if let Some(cb) = &on_error {
                        cb(&e);
                    }
                    attempt += 1;
                    if !retry.allows_attempt(attempt) {
                        warn!(attempt, "Reconnect attempts exhausted, stopping listener");
                        break 'outer;
                    }
                    metrics::record_reconnect_attempt();
                    if !backoff_or_shutdown(&mut shutdown_rx, retry.delay_for_attempt(attempt))
                        .await
                    {
                        break 'outer;
                    }
                    break; // reopen from the updated resume point
                }
            }
        }
    }

    let _ = state_tx.send(ListenerState::Stopped);
    debug!("Listener loop exited");
}
