//! Fid table: the server-side mapping from client-chosen fid numbers to
//! backend-owned state.
//!
//! Grounded on `struct l9p_fid`/`l9p_connection_alloc_fid`/
//! `l9p_connection_remove_fid`: a fid is refcounted because it can be
//! "pinned" by more than one in-flight request at once (e.g. a `Tread`
//! dispatched to a worker task while a `Tclunk` for the same fid arrives on
//! another), and is only handed back to the backend's `freefid` hook once
//! the last borrow is released.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::{Notify, OwnedRwLockReadGuard, RwLock};

use crate::error::{Error, ProtoError};
use crate::utils::Result;

/// A single fid's server-side state: the client-visible id plus whatever
/// the backend attaches to it (an open file handle, a path, ...). The pin
/// count is an `AtomicU32` rather than a plain field so [`Pin::drop`] can
/// release a borrow without needing to re-acquire the table's lock.
pub struct Fid<T> {
    pub fid: u32,
    pub aux: T,
    refcount: AtomicU32,
    /// Fires once when the last outstanding [`Pin`] drops and refcount
    /// reaches zero. `notify_one` stores a single permit even if nobody is
    /// waiting yet, so `Connection::finalize_fid` can check-then-await
    /// without a registration race.
    released: Notify,
}

impl<T> Fid<T> {
    fn new(fid: u32, aux: T) -> Self {
        Fid {
            fid,
            aux,
            refcount: AtomicU32::new(0),
            released: Notify::new(),
        }
    }

    /// Whether every borrow taken via [`FidTable::lookup`] has been
    /// released. Checked by `Connection` before handing a clunked fid to
    /// the backend's `freefid` hook.
    pub fn refcount_is_zero(&self) -> bool {
        self.refcount.load(Ordering::Acquire) == 0
    }

    /// Resolves once [`Fid::refcount_is_zero`] becomes true. Safe to call
    /// after already observing a nonzero count: `Notify::notify_one`
    /// stores its permit even if called before this is polled.
    pub async fn released(&self) {
        self.released.notified().await
    }
}

/// An owned borrow of a fid taken via [`FidTable::lookup`], held for as long
/// as a backend call needs it. Releases the pin on drop, so a fid's
/// [`Fid::refcount_is_zero`] reflects every in-flight request's view of it
/// with no separate "remember to release" call required of `Connection`.
pub struct Pin<T> {
    guard: OwnedRwLockReadGuard<Fid<T>>,
}

impl<T> Deref for Pin<T> {
    type Target = Fid<T>;

    fn deref(&self) -> &Fid<T> {
        &self.guard
    }
}

impl<T> Drop for Pin<T> {
    fn drop(&mut self) {
        if self.guard.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.guard.released.notify_one();
        }
    }
}

/// Per-connection table of live fids, keyed by fid number.
///
/// Every entry is wrapped in `Arc<RwLock<Fid<T>>>` so a request can hold a
/// borrow across an `.await` point without holding the whole table locked.
pub struct FidTable<T> {
    fids: RwLock<HashMap<u32, Arc<RwLock<Fid<T>>>>>,
}

impl<T> Default for FidTable<T> {
    fn default() -> Self {
        FidTable {
            fids: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> FidTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new fid. Errors with `FidInUse` if the number is already
    /// taken (the client violated the "newfid must be fresh" invariant).
    pub async fn allocate(&self, fid: u32, aux: T) -> Result<()> {
        let mut fids = self.fids.write().await;
        if fids.contains_key(&fid) {
            return Err(Error::Proto(ProtoError::FidInUse(fid)));
        }
        fids.insert(fid, Arc::new(RwLock::new(Fid::new(fid, aux))));
        Ok(())
    }

    /// Borrow a fid, incrementing its pin count. The returned `Arc` stays
    /// valid even if the fid is concurrently removed from the table by a
    /// racing `Tclunk` — see [`FidTable::remove`].
    pub async fn lookup(&self, fid: u32) -> Result<Arc<RwLock<Fid<T>>>> {
        let fids = self.fids.read().await;
        let entry = fids
            .get(&fid)
            .ok_or(Error::Proto(ProtoError::FidUnknown(fid)))?;
        entry.read().await.refcount.fetch_add(1, Ordering::AcqRel);
        Ok(entry.clone())
    }

    /// Borrow a fid for the duration of one backend call. Unlike
    /// [`FidTable::lookup`], the returned [`Pin`] releases itself on drop,
    /// so there is no separate release call for `Connection` to remember.
    pub async fn pin(&self, fid: u32) -> Result<Pin<T>> {
        let entry = self.lookup(fid).await?;
        Ok(Pin {
            guard: entry.read_owned().await,
        })
    }

    /// Mark a fid for removal (`Tclunk`/`Tremove`). The entry leaves the
    /// table immediately so no new borrow can start, but the `Arc` returned
    /// here may still have other live borrows outstanding — the caller
    /// (`Connection`) is responsible for waiting for the refcount to drop
    /// to zero before invoking the backend's `freefid` hook, matching the
    /// pin semantics in `DESIGN.md`.
    pub async fn remove(&self, fid: u32) -> Result<Arc<RwLock<Fid<T>>>> {
        let mut fids = self.fids.write().await;
        fids.remove(&fid)
            .ok_or(Error::Proto(ProtoError::FidUnknown(fid)))
    }

    /// Number of fids currently allocated.
    pub async fn len(&self) -> usize {
        self.fids.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every fid in the table (used on connection teardown, *not* on
    /// `Tversion` — see `Connection::negotiate`, which clunks fids
    /// individually via the backend so `freefid` still runs for each).
    pub async fn clear(&self) -> Vec<Arc<RwLock<Fid<T>>>> {
        self.fids.write().await.drain().map(|(_, v)| v).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocate_rejects_duplicate_fid() {
        let table: FidTable<()> = FidTable::new();
        table.allocate(1, ()).await.unwrap();
        assert!(table.allocate(1, ()).await.is_err());
    }

    #[tokio::test]
    async fn lookup_unknown_fid_is_bad_fd() {
        let table: FidTable<()> = FidTable::new();
        assert!(table.lookup(42).await.is_err());
    }

    #[tokio::test]
    async fn lookup_pins_fid_across_removal_attempt() {
        let table: FidTable<u32> = FidTable::new();
        table.allocate(1, 0).await.unwrap();
        let borrowed = table.lookup(1).await.unwrap();
        // The request table has taken fid 1 out from under a concurrent
        // Tclunk; the Arc is still valid for whoever holds it even though
        // the table no longer knows about fid 1.
        let removed = table.remove(1).await.unwrap();
        assert!(!removed.read().await.refcount_is_zero());
        assert_eq!(borrowed.read().await.fid, 1);
    }

    #[tokio::test]
    async fn pin_releases_on_drop() {
        let table: FidTable<()> = FidTable::new();
        table.allocate(1, ()).await.unwrap();
        let removed;
        {
            let pin = table.pin(1).await.unwrap();
            assert_eq!(pin.fid, 1);
            // `remove` takes the entry out of the table without touching
            // its pin count, so it can be inspected independently of `pin`.
            removed = table.remove(1).await.unwrap();
            assert!(!removed.read().await.refcount_is_zero());
        }
        assert!(removed.read().await.refcount_is_zero());
    }
}
