//! Checked-out connection handle.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::addr::{Address, Target};
use crate::net::{Connection, ConnectionId};
use crate::pool::PoolHandle;

/// A connection on loan from a pool.
///
/// Exactly one terminal action happens per lease: [`release`](Self::release)
/// returns it for reuse, [`discard`](Self::discard) or [`close`](Self::close)
/// closes it. Later calls are no-ops. Dropping an unsettled lease discards it,
/// since the stream position is unknown.
pub struct Lease {
    conn: Option<Connection>,
    id: ConnectionId,
    pool: PoolHandle,
    reused: bool,
    settled: AtomicBool,
}

impl Lease {
    pub(crate) fn new(conn: Connection, pool: PoolHandle, reused: bool) -> Self {
        Self {
            id: conn.id(),
            conn: Some(conn),
            pool,
            reused,
            settled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn target(&self) -> &Target {
        self.pool.target()
    }

    pub fn peer(&self) -> Option<&Address> {
        self.conn.as_ref().map(Connection::peer)
    }

    /// Whether this connection came from the idle set rather than a fresh dial.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Hand the connection back to its pool.
    pub fn release(&mut self) {
        if !self.settle() {
            return;
        }
        let Some(conn) = self.conn.take() else { return };
        if let Err(conn) = self.pool.release(conn) {
            tracing::debug!(target = %self.pool.target(), connection_id = %self.id, "Pool closed, closing released connection");
            conn.close_in_background();
        }
    }

    /// Close the connection without waiting for the shutdown to finish.
    pub fn discard(&mut self) {
        if !self.settle() {
            return;
        }
        if let Some(conn) = self.conn.take() {
            tracing::debug!(target = %self.pool.target(), connection_id = %self.id, "Discarding connection");
            conn.close_in_background();
        }
    }

    /// Close the connection and wait for the shutdown.
    pub async fn close(mut self) {
        if !self.settle() {
            return;
        }
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
    }

    /// `true` for exactly one caller.
    fn settle(&self) -> bool {
        self.settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn stream(&mut self) -> io::Result<Pin<&mut Connection>> {
        match self.conn.as_mut() {
            Some(conn) => Ok(Pin::new(conn)),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "lease already released or closed",
            )),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.discard();
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("target", &self.pool.target().to_string())
            .field("reused", &self.reused)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl AsyncRead for Lease {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => stream.poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for Lease {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream() {
            Ok(stream) => stream.poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => stream.poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => stream.poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}
