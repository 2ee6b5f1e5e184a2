//! Outbound connection type and identity.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing and reuse checks
//! - Erase the concrete stream type (TCP, tunneled, TLS) behind one object
//! - Remember which peer the connection reaches

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::addr::Address;

/// Global atomic counter for connection IDs.
/// Relaxed ordering suffices; only uniqueness is needed.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Any bidirectional byte stream the transport can carry.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A live transport connection.
///
/// Tunneling and TLS upgrades replace the inner stream but keep the ID, so a
/// connection keeps its identity for its whole life.
pub struct Connection {
    id: ConnectionId,
    peer: Address,
    stream: Box<dyn AsyncStream>,
}

impl Connection {
    pub fn new(peer: Address, stream: impl AsyncStream + 'static) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            stream: Box::new(stream),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The hop this connection currently speaks to.
    pub fn peer(&self) -> &Address {
        &self.peer
    }

    /// Take the inner stream out, e.g. to wrap it in TLS.
    pub fn into_parts(self) -> (ConnectionId, Address, Box<dyn AsyncStream>) {
        (self.id, self.peer, self.stream)
    }

    /// Reassemble a connection around a replacement stream.
    pub fn from_parts(id: ConnectionId, peer: Address, stream: impl AsyncStream + 'static) -> Self {
        Self {
            id,
            peer,
            stream: Box::new(stream),
        }
    }

    /// Best-effort graceful close.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::trace!(connection_id = %self.id, error = %e, "Shutdown on close failed");
        }
        tracing::trace!(connection_id = %self.id, peer = %self.peer, "Connection closed");
    }

    /// Close without waiting. Usable from `Drop` and poll functions.
    ///
    /// Outside a runtime the stream is simply dropped.
    pub fn close_in_background(self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.close());
            }
            Err(_) => drop(self),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}
