#![forbid(unsafe_code)]
//! Asynchronous 9P filesystem server library for Rust.
//!
//! This crate provides a tokio-based async implementation of the 9P protocol
//! family — plain 9P2000, the Unix-extended 9P2000.u, and the Linux-extended
//! 9P2000.L — allowing you to build virtual filesystem servers that can be
//! mounted using the Linux kernel's v9fs module or any other 9P client.
//!
//! # Overview
//!
//! The 9P protocol was originally developed for the Plan 9 distributed operating system.
//! 9P2000.u layered Unix uid/gid/symlink semantics on top of it, and 9P2000.L
//! replaced those with a closer match to Linux's own syscalls. A single
//! [`conn::Connection`] negotiates whichever dialect the client asks for and
//! routes requests to the matching [`backend::Backend`] methods.
//!
//! # Getting Started
//!
//! To create a 9P filesystem server, you need to:
//!
//! 1. Define a type to represent your per-fid state (or use `()` for stateless fids)
//! 2. Implement the [`backend::Backend`] trait for your filesystem type
//! 3. Start the server with [`server::Server`] and a [`transport::Transport`]
//!
//! # Example
//!
//! ```no_run
//! use ninep::{backend::Backend, fid::Fid, Result, FCall, QId, QIdType};
//! use async_trait::async_trait;
//!
//! // Define your filesystem
//! struct MyFs;
//!
//! // Define per-fid state (or use () if you don't need state)
//! #[derive(Default)]
//! struct MyFid {
//!     // Your per-fid data here
//! }
//!
//! #[async_trait]
//! impl Backend for MyFs {
//!     type FId = MyFid;
//!
//!     async fn rattach(
//!         &self,
//!         _fid: &Fid<Self::FId>,
//!         _afid: Option<&Fid<Self::FId>>,
//!         _uname: &str,
//!         _aname: &str,
//!         _n_uname: u32,
//!     ) -> Result<FCall> {
//!         // Initialize the root fid and return its qid
//!         Ok(FCall::RAttach {
//!             qid: QId {
//!                 typ: QIdType::DIR,
//!                 version: 0,
//!                 path: 0,
//!             }
//!         })
//!     }
//!
//!     // Implement other required methods...
//! }
//! ```
//!
//! # Protocol Details
//!
//! ## Message Flow
//!
//! 1. **Version Negotiation**: Client sends `Tversion`, server responds with `Rversion`
//! 2. **Authentication** (optional): `Tauth`/`Rauth` exchange
//! 3. **Attach**: Client attaches to the filesystem root with `Tattach`
//! 4. **Operations**: Client performs file operations (`walk`, `open`, `read`, `write`, etc.)
//! 5. **Cleanup**: Client clunks fids with `Tclunk` to release resources
//!
//! ## Fid Management
//!
//! A "fid" (file identifier) is a 32-bit handle used by the client to reference a file
//! or directory. The server tracks the mapping between fids and filesystem objects
//! in [`fid::FidTable`], refcounting each so a fid pinned by one in-flight request
//! cannot be finalized out from under another.
//!
//! **Important invariants:**
//! - Each fid is unique per connection
//! - Fids persist across operations until explicitly clunked
//! - Walking to a new fid creates a new fid (the old one remains valid)
//! - After `Tclunk`, the fid is invalid once its refcount reaches zero
//!
//! # Error Handling
//!
//! Return errors using the [`error::Error`] type. The server will automatically
//! convert these to `Rlerror` (numeric) or `Rerror` (stringly, pre-.L dialects)
//! messages with appropriate error codes (errno).
//!
//! Common error codes:
//! - `ENOENT` - File not found
//! - `EACCES` / `EPERM` - Permission denied
//! - `EISDIR` - Is a directory (when file expected)
//! - `ENOTDIR` - Not a directory (when directory expected)
//! - `EBADF` - Bad file descriptor (invalid fid)
//! - `ELOOP` - Too many levels of symbolic links
//!
//! # Transport
//!
//! The library supports multiple transports:
//! - **TCP**: `"tcp!host!port"` (e.g., `"tcp!0.0.0.0!564"`)
//! - **Unix Domain Sockets**: `"unix!path!suffix"` (e.g., `"unix!/tmp/socket!0"`)
//!
//! # Feature Flags
//!
//! This crate uses workspace dependencies and requires:
//! - `tokio` with `full` features for async runtime
//! - `async-trait` for trait async methods
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`) and relies on Rust's
//! type system for memory safety. All filesystem operations are async and designed
//! to be cancellation-safe.
pub mod backend;
pub mod conn;
pub mod dialect;
pub mod error;
pub mod fcall;
pub mod fid;
pub mod iovec;
pub mod pool;
pub mod request;
pub mod serialize;
pub mod server;
pub mod transport;
#[macro_use]
pub mod utils;

/// Default negotiated message size, used until `Tversion` lowers it.
pub const DEFAULT_MSIZE: u32 = 8192;

/// Worker tasks in a connection's dispatch pool, absent an explicit override.
pub const DEFAULT_WORKERS: usize = 8;

/// Bound on a connection's intake queue depth before `recv` backpressures.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
