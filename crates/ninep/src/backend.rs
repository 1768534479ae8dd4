//! The backend contract: what a filesystem implementation provides to the
//! dispatcher.
//!
//! Grounded on the `Filesystem` server trait this crate's dispatch model
//! descends from (method names, default `EOPNOTSUPP` bodies, and the
//! `FId<T>`-carrying call style are all kept); extended with the classic
//! 9P2000/9P2000.u operations it dropped (`ropen`/`rcreate`/`rstat`/`rwstat`)
//! and a `freefid` hook translated from `lib9p.h`'s implicit close-fid
//! backend callback.
//!
//! # On `EJUSTRETURN`
//!
//! The C core this crate's design is grounded on returns the sentinel
//! `EJUSTRETURN` from a backend callback to mean "I have taken ownership of
//! this request and will call `l9p_respond` myself later, possibly from a
//! different worker thread" — necessary there because a C callback has no
//! way to suspend and resume itself. An `async fn` already *is* that
//! suspend/resume mechanism: a [`Backend`] method can simply `.await` as
//! long as it needs (on a channel, a lock, a blocking task) and the worker
//! task stays parked until it resolves, with no separate sentinel required.
//! [`Outcome`] is only threaded through the two places deferral is still
//! externally observable — [`crate::pool`]'s dispatch loop, where a request
//! can be cancelled by a racing `Tflush` before a worker ever calls the
//! backend at all, or deferred because `Tflush` arrived while its target
//! was already running.
use async_trait::async_trait;

use crate::dialect::Dialect;
use crate::error::{self, errno::*};
use crate::fcall::*;
use crate::utils::Result;

/// Per-fid handle a backend sees: the client-visible fid number plus the
/// backend's own state for it. This is exactly [`crate::fid::Fid`] — the
/// same record the connection's fid table stores, borrowed for the
/// duration of one backend call rather than copied, since `Self::FId` may
/// hold an exclusive resource (an open file descriptor) that cannot be
/// cloned.
pub use crate::fid::Fid as FId;

/// What a worker did with a request pulled off the intake queue.
#[derive(Debug)]
pub enum Outcome {
    /// The backend ran and produced a response to send.
    Done(FCall),
    /// A `Tflush` for this tag won the race before any worker picked up the
    /// request; no response is sent for the original tag; the queued
    /// `Rflush` is all that is returned to the client.
    Cancelled,
    /// This was a `Tflush` whose target tag was still outstanding. No
    /// reply is sent for the `Tflush` itself yet — the worker that finishes
    /// the target tag drains its pending flushes and answers each with
    /// `Rflush`, after the target's own response, matching the ordering
    /// `Tflush` promises a client.
    Deferred,
}

#[async_trait]
/// Filesystem backend trait for implementing 9P servers.
///
/// Implementors represent an error condition by returning `Err`. Otherwise
/// they return the `FCall` response variant the operation's name implies.
///
/// # FId Management
///
/// `FId` stores per-fid backend state. Fids are created during `rattach` and
/// `rwalk`/`rxattrwalk`, and released in `rclunk` — but since a fid can be
/// pinned by more than one in-flight request (see [`crate::fid::FidTable`]),
/// implementors that hold exclusive resources (open file descriptors)
/// should release them in [`Backend::freefid`] rather than in `rclunk`
/// itself, since `freefid` only runs once the refcount reaches zero.
pub trait Backend: Send + Sync {
    /// Per-fid state.
    type FId: Send + Sync + Default;

    // 9P2000.L

    async fn rstatfs(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rlopen(&self, _: &FId<Self::FId>, _flags: u32) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rlcreate(
        &self,
        _: &FId<Self::FId>,
        _name: &str,
        _flags: u32,
        _mode: u32,
        _gid: u32,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rsymlink(
        &self,
        _: &FId<Self::FId>,
        _name: &str,
        _sym: &str,
        _gid: u32,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rmknod(
        &self,
        _: &FId<Self::FId>,
        _name: &str,
        _mode: u32,
        _major: u32,
        _minor: u32,
        _gid: u32,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rrename(&self, _: &FId<Self::FId>, _: &FId<Self::FId>, _name: &str) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rreadlink(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rgetattr(&self, _: &FId<Self::FId>, _req_mask: GetAttrMask) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rsetattr(
        &self,
        _: &FId<Self::FId>,
        _valid: SetAttrMask,
        _stat: &SetAttr,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rxattrwalk(
        &self,
        _: &FId<Self::FId>,
        _: &FId<Self::FId>,
        _name: &str,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rxattrcreate(
        &self,
        _: &FId<Self::FId>,
        _name: &str,
        _attr_size: u64,
        _flags: u32,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rreaddir(&self, _: &FId<Self::FId>, _offset: u64, _count: u32) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rfsync(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rlock(&self, _: &FId<Self::FId>, _lock: &Flock) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rgetlock(&self, _: &FId<Self::FId>, _lock: &Getlock) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rlink(&self, _: &FId<Self::FId>, _: &FId<Self::FId>, _name: &str) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rmkdir(
        &self,
        _: &FId<Self::FId>,
        _name: &str,
        _mode: u32,
        _gid: u32,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rrenameat(
        &self,
        _: &FId<Self::FId>,
        _oldname: &str,
        _: &FId<Self::FId>,
        _newname: &str,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn runlinkat(&self, _: &FId<Self::FId>, _name: &str, _flags: u32) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /*
     * 9P2000.u subset
     */

    async fn rauth(
        &self,
        _: &FId<Self::FId>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rattach(
        &self,
        _: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /*
     * 9P2000 subset, shared across all dialects
     */

    async fn rwalk(
        &self,
        _: &FId<Self::FId>,
        _new: &FId<Self::FId>,
        _wnames: &[String],
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rread(&self, _: &FId<Self::FId>, _offset: u64, _count: u32) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rwrite(&self, _: &FId<Self::FId>, _offset: u64, _data: &Data) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rclunk(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rremove(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Negotiate protocol version and message size. The default accepts
    /// every dialect this crate implements and rejects everything else
    /// with [`VERSION_UNKNOWN`], matching `lib9p.h`'s
    /// `l9p_dispatch_request` handling of `Tversion`.
    async fn rversion(&self, msize: u32, ver: &str) -> Result<FCall> {
        Ok(FCall::RVersion {
            msize,
            version: match Dialect::from_version_string(ver) {
                Some(_) => ver.to_owned(),
                None => VERSION_UNKNOWN.to_owned(),
            },
        })
    }

    /*
     * Classic 9P2000/9P2000.u operations with no 9P2000.L analogue.
     * The client's own message type already picks between these and the
     * .L operations above (Topen vs Tlopen, Tcreate vs Tlcreate, ...), so
     * `conn::Connection::run` dispatches straight to whichever the wire
     * carried; a dialect-.L-only backend simply never receives the
     * classic variants and need not implement them.
     */

    async fn ropen(&self, _: &FId<Self::FId>, _mode: u8) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rcreate(
        &self,
        _: &FId<Self::FId>,
        _name: &str,
        _perm: u32,
        _mode: u8,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rstat(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    async fn rwstat(&self, _: &FId<Self::FId>, _stat: &p92000::Stat) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Called once a fid's refcount drops to zero after removal from the
    /// fid table (`Tclunk`/`Tremove`, or connection teardown). Backends
    /// that stash an open file descriptor or similar exclusive resource in
    /// `Self::FId` should release it here rather than in `rclunk`, so a
    /// `Tread` racing a `Tclunk` on the same fid can still complete.
    ///
    /// Grounded on the implicit fid-close callback `lib9p.h` assumes every
    /// backend vtable provides.
    async fn freefid(&self, _fid: &FId<Self::FId>) {}
}
