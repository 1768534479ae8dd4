//! Request table: tag-keyed bookkeeping for in-flight requests.
//!
//! Grounded on `struct l9p_request` (`lr_tag`, `lr_fid`, `lr_fid2`,
//! `lr_newfid`). The teacher has no equivalent — it decodes a message,
//! dispatches it, and forgets it ever existed, which is why it cannot
//! implement `Tflush` correctly (there is nothing left to flush by the
//! time a `Tflush` for an earlier tag would arrive). This table is what
//! lets [`crate::pool`] and [`crate::conn`] answer "is this tag still
//! outstanding, and if so, can I cancel it before it runs?".

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::error::{Error, ProtoError};
use crate::fcall::FCall;
use crate::utils::Result;

/// Lifecycle state of a request between receipt and reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Decoded and enqueued on the intake channel, not yet picked up by a
    /// worker.
    Queued,
    /// A worker task is currently executing the backend call.
    InFlight,
}

struct Entry {
    state: RequestState,
}

/// Per-connection table of outstanding request tags.
#[derive(Default)]
pub struct RequestTable {
    entries: Mutex<HashMap<u16, Entry>>,
    /// oldtag -> the tags of the `Tflush`es naming it, still unanswered.
    /// Consulted by the worker after it finishes running the target so it
    /// knows which tags to answer with a deferred `Rflush`, after the
    /// target's own response, in that order. A single tag can be flushed
    /// more than once, so each oldtag maps to a list, not just one tag.
    pending_flush: Mutex<HashMap<u16, Vec<u16>>>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly decoded request. Errors with `TagInUse` if the
    /// tag is already outstanding — `NOTAG` is exempt since `Tversion`
    /// always uses it and never waits behind a prior `Tversion`.
    pub async fn insert(&self, tag: u16) -> Result<()> {
        if tag == crate::fcall::NOTAG {
            return Ok(());
        }
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&tag) {
            return Err(Error::Proto(ProtoError::TagInUse(tag)));
        }
        entries.insert(
            tag,
            Entry {
                state: RequestState::Queued,
            },
        );
        Ok(())
    }

    pub async fn mark_in_flight(&self, tag: u16) {
        if let Some(entry) = self.entries.lock().await.get_mut(&tag) {
            entry.state = RequestState::InFlight;
        }
    }

    pub async fn state(&self, tag: u16) -> Option<RequestState> {
        self.entries.lock().await.get(&tag).map(|e| e.state)
    }

    /// Remove a tag once its response has been sent.
    pub async fn remove(&self, tag: u16) {
        self.entries.lock().await.remove(&tag);
        self.pending_flush.lock().await.remove(&tag);
    }

    /// Record that `Tflush` tag `flush_tag` named `oldtag`. Returns whether
    /// `oldtag` was still outstanding (if not, the flush target already
    /// answered and `Rflush` should be sent immediately with no further
    /// action).
    pub async fn flush(&self, oldtag: u16, flush_tag: u16) -> bool {
        let still_outstanding = self.entries.lock().await.contains_key(&oldtag);
        if still_outstanding {
            self.pending_flush
                .lock()
                .await
                .entry(oldtag)
                .or_default()
                .push(flush_tag);
        }
        still_outstanding
    }

    /// Whether `tag` has a deferred `Rflush` waiting on it, without
    /// consuming it. Used by a worker about to run `tag`'s handler to
    /// decide whether a racing `Tflush` already claimed it.
    pub async fn has_pending_flush(&self, tag: u16) -> bool {
        self.pending_flush
            .lock()
            .await
            .get(&tag)
            .is_some_and(|flushes| !flushes.is_empty())
    }

    /// Take every `Tflush` tag recorded against `tag`, so the worker that
    /// just finished `tag` can answer each of them with `Rflush`.
    pub async fn take_pending_flushes(&self, tag: u16) -> Vec<u16> {
        self.pending_flush.lock().await.remove(&tag).unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// A decoded request bound for the dispatch pool.
pub struct Request {
    pub tag: u16,
    pub body: FCall,
}

impl Request {
    pub fn new(tag: u16, body: FCall) -> Self {
        Request { tag, body }
    }

    /// Fids this request borrows, per `FCall::fids`/`FCall::newfid`.
    pub fn fids(&self) -> Vec<u32> {
        self.body.fids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_tag_is_rejected() {
        let table = RequestTable::new();
        table.insert(5).await.unwrap();
        assert!(table.insert(5).await.is_err());
    }

    #[tokio::test]
    async fn notag_is_always_allowed() {
        let table = RequestTable::new();
        table.insert(crate::fcall::NOTAG).await.unwrap();
        table.insert(crate::fcall::NOTAG).await.unwrap();
    }

    #[tokio::test]
    async fn flush_on_absent_tag_reports_not_outstanding() {
        let table = RequestTable::new();
        assert!(!table.flush(99, 100).await);
    }

    #[tokio::test]
    async fn flush_on_live_tag_marks_pending() {
        let table = RequestTable::new();
        table.insert(3).await.unwrap();
        assert!(table.flush(3, 4).await);
        assert!(table.has_pending_flush(3).await);
        assert_eq!(table.take_pending_flushes(3).await, vec![4]);
        // Second read finds nothing left to take.
        assert!(!table.has_pending_flush(3).await);
        assert_eq!(table.take_pending_flushes(3).await, Vec::<u16>::new());
    }

    #[tokio::test]
    async fn flush_records_every_flush_tag_naming_the_same_oldtag() {
        let table = RequestTable::new();
        table.insert(3).await.unwrap();
        assert!(table.flush(3, 4).await);
        assert!(table.flush(3, 5).await);
        assert_eq!(table.take_pending_flushes(3).await, vec![4, 5]);
    }

    #[tokio::test]
    async fn tag_is_reusable_after_removal() {
        let table = RequestTable::new();
        table.insert(1).await.unwrap();
        table.remove(1).await;
        table.insert(1).await.unwrap();
    }
}
