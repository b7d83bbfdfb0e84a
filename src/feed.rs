// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Low-level resumable change-feed reader.
//!
//! [`ChangeFeedReader`] wraps the raw stream handle a store hands out and
//! tracks the last successfully delivered sequence token. When the
//! transport fails - an `Err` item, or a continuous stream ending without
//! being cancelled - the reader surfaces
//! [`ReplicationError::FeedInterrupted`] carrying that token, so the caller
//! can reopen with `since = last_seq` and miss nothing.
//!
//! # Resumption
//!
//! ```text
//! open(since = S) → next() → change seq=S+1 → next() → Err(interrupted, last_seq=S+1)
//!                                                 │
//!                        open(since = S+1) ◄──────┘
//! ```

use crate::change::{Change, FeedMode, Since};
use crate::error::{ReplicationError, Result};
use crate::store::{ChangeStream, DocumentStore};
use futures::StreamExt;
use tracing::{debug, trace};

/// Resumable iterator over a store's change stream.
pub struct ChangeFeedReader {
    stream: ChangeStream,
    mode: FeedMode,
    last_seq: Option<String>,
    finished: bool,
}

impl std::fmt::Debug for ChangeFeedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeedReader")
            .field("mode", &self.mode)
            .field("last_seq", &self.last_seq)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl ChangeFeedReader {
    /// Open a feed on `store` from the given resume point.
    pub async fn open<S: DocumentStore + ?Sized>(
        store: &S,
        since: Since,
        mode: FeedMode,
        include_docs: bool,
    ) -> Result<Self> {
        debug!(since = %since, ?mode, include_docs, "Opening change feed");
        let stream = store
            .open_change_feed(since.clone(), mode, include_docs)
            .await
            .map_err(|e| ReplicationError::store("open_change_feed", e))?;
        Ok(Self {
            stream,
            mode,
            last_seq: match since {
                Since::Beginning => None,
                Since::Seq(s) => Some(s),
            },
            finished: false,
        })
    }

    /// Sequence token of the last successfully delivered change, or the
    /// token the feed was opened from.
    pub fn last_seq(&self) -> Option<&str> {
        self.last_seq.as_deref()
    }

    /// The resume point a fresh reader should be opened from.
    pub fn resume_point(&self) -> Since {
        match &self.last_seq {
            Some(s) => Since::Seq(s.clone()),
            None => Since::Beginning,
        }
    }

    /// Deliver the next change.
    ///
    /// `Ok(None)` marks the natural end of a [`FeedMode::Normal`] feed. In
    /// continuous mode the stream has no natural end, so both transport
    /// errors and a premature end surface as
    /// [`ReplicationError::FeedInterrupted`].
    pub async fn next(&mut self) -> Result<Option<Change>> {
        if self.finished {
            return Ok(None);
        }
        match self.stream.next().await {
            Some(Ok(change)) => {
                trace!(seq = %change.seq, id = %change.id, deleted = change.deleted, "Change delivered");
                self.last_seq = Some(change.seq.clone());
                Ok(Some(change))
            }
            Some(Err(e)) => {
                debug!(error = %e, last_seq = ?self.last_seq, "Change feed errored");
                self.finished = true;
                Err(ReplicationError::FeedInterrupted {
                    last_seq: self.last_seq.clone(),
                })
            }
            None => {
                self.finished = true;
                match self.mode {
                    FeedMode::Normal => Ok(None),
                    FeedMode::Continuous => {
                        debug!(last_seq = ?self.last_seq, "Continuous feed ended prematurely");
                        Err(ReplicationError::FeedInterrupted {
                            last_seq: self.last_seq.clone(),
                        })
                    }
                }
            }
        }
    }
}
