//! Top-level server: binds a transport and spawns one
//! [`crate::transport::serve_connection`] task per accepted connection.
//!
//! Grounded on `lib9p.h`'s `struct l9p_server`, which owns the backend
//! binding, a server-wide maximum negotiable dialect (`ls_max_version`),
//! and the set of live connections (`ls_conns`) — none of which the bare
//! accept loop this module is otherwise built from has a counterpart for.
//! The accept-loop shape and graceful-shutdown handling
//! (`SIGTERM`/`SIGINT` via `tokio::select!`) are kept as-is.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Mutex;

use crate::backend::Backend;
use crate::conn::Connection;
use crate::dialect::Dialect;
use crate::error::Error;
use crate::transport::serve_connection;
use crate::utils::{self, Result};

/// Owns a backend and exposes the transports it can be served over. A
/// `Server` outlives any individual connection; each accepted socket gets
/// its own [`Connection`] and worker pool, registered here for the
/// lifetime of that connection.
pub struct Server<B> {
    backend: Arc<B>,
    max_dialect: Dialect,
    connections: Arc<Mutex<Vec<Weak<Connection<B>>>>>,
}

impl<B: Backend + 'static> Server<B> {
    pub fn new(backend: B) -> Self {
        Self::with_max_dialect(backend, Dialect::P92000L)
    }

    /// Like [`Server::new`], but caps every connection's negotiated
    /// dialect at `max_dialect`, regardless of what the client requests and
    /// the backend would otherwise grant. Mirrors `ls_max_version`.
    pub fn with_max_dialect(backend: B, max_dialect: Dialect) -> Self {
        Server {
            backend: Arc::new(backend),
            max_dialect,
            connections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of connections currently registered and still alive. Prunes
    /// entries whose connection has since been dropped.
    pub async fn connection_count(&self) -> usize {
        let mut conns = self.connections.lock().await;
        conns.retain(|c| c.strong_count() > 0);
        conns.len()
    }

    /// Serve over TCP, spawning one task per accepted connection,
    /// unconditionally until the listener errors.
    pub async fn serve_tcp(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        loop {
            let (stream, peer) = listener.accept().await?;
            info!("accepted: {:?}", peer);
            let backend = self.backend.clone();
            let max_dialect = self.max_dialect;
            let connections = self.connections.clone();
            tokio::spawn(async move {
                let conn = Arc::new(Connection::with_max_dialect(backend, max_dialect));
                connections.lock().await.push(Arc::downgrade(&conn));
                let (read_half, write_half) = stream.into_split();
                if let Err(e) = serve_connection(conn, read_half, write_half).await {
                    error!("connection {:?} ended with error: {:?}", peer, e);
                }
            });
        }
    }

    /// Serve over a Unix domain socket, removing the socket file on drop,
    /// and shutting down cleanly on `SIGTERM`/`SIGINT`.
    pub async fn serve_unix(&self, addr: impl AsRef<Path>) -> Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let listener = DeleteOnDrop::bind(addr)?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let running = Arc::new(AtomicBool::new(true));

        {
            let running = running.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                    _ = sigint.recv() => info!("received SIGINT, shutting down"),
                }
                running.store(false, Ordering::SeqCst);
            });
        }

        while running.load(Ordering::SeqCst) {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            info!("accepted: {:?}", peer);
                            let backend = self.backend.clone();
                            let max_dialect = self.max_dialect;
                            let connections = self.connections.clone();
                            tokio::spawn(async move {
                                let conn = Arc::new(Connection::with_max_dialect(backend, max_dialect));
                                connections.lock().await.push(Arc::downgrade(&conn));
                                let (read_half, write_half) = tokio::io::split(stream);
                                if let Err(e) = serve_connection(conn, read_half, write_half).await {
                                    error!("connection ended with error: {:?}", e);
                                }
                            });
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
            }
        }

        info!("server shutdown complete");
        Ok(())
    }

    /// Dispatch by protocol prefix, e.g. `"tcp!0.0.0.0!564"` or
    /// `"unix!/tmp/ninep.sock!0"`. The trailing field is a port for `tcp`
    /// and an ignored suffix (matching 9P mount convention) for `unix`.
    pub async fn serve(&self, addr: &str) -> Result<()> {
        let (proto, host_or_path, port) = utils::parse_proto(addr)
            .ok_or_else(|| Error::from(io_err!(InvalidInput, "invalid protocol or address")))?;

        match proto {
            "tcp" => self.serve_tcp(&format!("{}:{}", host_or_path, port)).await,
            "unix" => self.serve_unix(host_or_path).await,
            _ => Err(Error::from(io_err!(InvalidInput, "protocol not supported"))),
        }
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            error!("failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullBackend;

    #[async_trait]
    impl Backend for NullBackend {
        type FId = ();
    }

    #[tokio::test]
    async fn fresh_server_has_no_registered_connections() {
        let server = Server::new(NullBackend);
        assert_eq!(server.connection_count().await, 0);
    }

    #[tokio::test]
    async fn with_max_dialect_overrides_the_default_ceiling() {
        let server = Server::with_max_dialect(NullBackend, Dialect::P92000U);
        assert_eq!(server.max_dialect, Dialect::P92000U);
    }

    #[tokio::test]
    async fn new_defaults_to_the_newest_dialect() {
        let server = Server::new(NullBackend);
        assert_eq!(server.max_dialect, Dialect::P92000L);
    }
}
