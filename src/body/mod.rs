//! Streaming response bodies over leased connections.
//!
//! # Data Flow
//! ```text
//! Lease → BufReader<Lease>
//!     → head.rs (status line + headers, derives Framing)
//!     → content_length.rs | chunked.rs | close_delimited.rs
//!     → expected end: release to pool
//!       anything else: discard
//! ```
//!
//! # Design Decisions
//! - Readers are poll-based `AsyncRead`s; they never buffer a whole body
//! - A connection is released only when the framing ended exactly where
//!   declared and nothing unread is left in the buffer
//! - Any I/O error or framing fault discards the connection
//! - Framing faults surface as `io::Error` wrapping [`FramingError`](crate::error::FramingError)

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, BufReader, ReadBuf};

use crate::error::FramingError;
use crate::pool::Lease;

pub mod chunked;
pub mod close_delimited;
pub mod content_length;
pub mod head;

pub use chunked::ChunkedBody;
pub use close_delimited::CloseDelimitedBody;
pub use content_length::ContentLengthBody;
pub use head::ResponseHead;

/// How a message body's end is determined on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    ContentLength(u64),
    Chunked,
    /// Body runs until the peer closes; the connection is never reusable.
    CloseDelimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Streaming,
    Finished,
    Failed,
}

/// Reader, lease and terminal bookkeeping shared by every body variant.
pub(crate) struct BodyBase {
    pub(crate) reader: BufReader<Lease>,
    force_close: bool,
    state: BodyState,
}

impl BodyBase {
    pub(crate) fn new(reader: BufReader<Lease>, force_close: bool) -> Self {
        Self {
            reader,
            force_close,
            state: BodyState::Streaming,
        }
    }

    /// Short-circuit for reads after the body ended one way or the other.
    pub(crate) fn poll_settled(&self) -> Option<Poll<io::Result<()>>> {
        match self.state {
            BodyState::Streaming => None,
            BodyState::Finished => Some(Poll::Ready(Ok(()))),
            BodyState::Failed => Some(Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "body stream already failed",
            )))),
        }
    }

    /// The body ended where its framing said it would.
    pub(crate) fn finish(&mut self) {
        if self.state != BodyState::Streaming {
            return;
        }
        self.state = BodyState::Finished;

        let leftover = self.reader.buffer().len();
        let lease = self.reader.get_mut();
        if self.force_close {
            tracing::debug!(connection_id = %lease.id(), "Body complete, closing connection");
            lease.discard();
        } else if leftover > 0 {
            tracing::debug!(connection_id = %lease.id(), leftover, "Unread bytes after body, closing connection");
            lease.discard();
        } else {
            tracing::debug!(connection_id = %lease.id(), "Body complete, releasing connection");
            lease.release();
        }
    }

    /// Record a fault, discard the connection and hand the error back.
    pub(crate) fn fail(&mut self, err: io::Error) -> io::Error {
        if self.state == BodyState::Streaming {
            self.state = BodyState::Failed;
            let lease = self.reader.get_mut();
            match FramingError::from_io(&err) {
                Some(framing) => {
                    tracing::warn!(connection_id = %lease.id(), error = %framing, "Body framing fault, discarding connection")
                }
                None => {
                    tracing::debug!(connection_id = %lease.id(), error = %err, "Body read failed, discarding connection")
                }
            }
            lease.discard();
        }
        err
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state == BodyState::Finished
    }

    pub(crate) fn lease(&self) -> &Lease {
        self.reader.get_ref()
    }
}

/// A response body of any framing.
pub enum Body {
    ContentLength(ContentLengthBody),
    Chunked(ChunkedBody),
    CloseDelimited(CloseDelimitedBody),
}

impl Body {
    /// Build the reader matching `framing` over a reader that has already
    /// consumed the response head.
    ///
    /// `force_close` discards the connection even when the body ends cleanly,
    /// e.g. for a `Connection: close` response.
    pub fn new(reader: BufReader<Lease>, framing: Framing, force_close: bool) -> Self {
        match framing {
            Framing::ContentLength(length) => {
                Body::ContentLength(ContentLengthBody::new(reader, length, force_close))
            }
            Framing::Chunked => Body::Chunked(ChunkedBody::new(reader, force_close)),
            Framing::CloseDelimited => Body::CloseDelimited(CloseDelimitedBody::new(reader)),
        }
    }

    pub fn from_lease(lease: Lease, framing: Framing, force_close: bool) -> Self {
        Self::new(BufReader::new(lease), framing, force_close)
    }

    pub fn framing(&self) -> Framing {
        match self {
            Body::ContentLength(body) => Framing::ContentLength(body.length()),
            Body::Chunked(_) => Framing::Chunked,
            Body::CloseDelimited(_) => Framing::CloseDelimited,
        }
    }

    /// Whether the body reached its expected end.
    pub fn is_finished(&self) -> bool {
        match self {
            Body::ContentLength(body) => body.is_finished(),
            Body::Chunked(body) => body.is_finished(),
            Body::CloseDelimited(body) => body.is_finished(),
        }
    }

    pub fn lease(&self) -> &Lease {
        match self {
            Body::ContentLength(body) => body.lease(),
            Body::Chunked(body) => body.lease(),
            Body::CloseDelimited(body) => body.lease(),
        }
    }
}

impl AsyncRead for Body {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Body::ContentLength(body) => Pin::new(body).poll_read(cx, buf),
            Body::Chunked(body) => Pin::new(body).poll_read(cx, buf),
            Body::CloseDelimited(body) => Pin::new(body).poll_read(cx, buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::testing::{scripted_lease, ScriptedConnector};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn body_dispatches_on_framing() {
        let connector = ScriptedConnector::new(b"3\r\nabc\r\n0\r\n\r\n");
        let (pool, lease) = scripted_lease(&connector).await;

        let mut body = Body::from_lease(lease, Framing::Chunked, false);
        assert_eq!(body.framing(), Framing::Chunked);
        let mut out = String::new();
        body.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "abc");
        assert!(body.is_finished());
        assert!(body.lease().is_settled());
        assert_eq!(pool.stats().await.unwrap().idle, 1);
    }

    #[tokio::test]
    async fn force_close_discards_clean_body() {
        let connector = ScriptedConnector::new(b"hello");
        let (pool, lease) = scripted_lease(&connector).await;

        let mut body = Body::from_lease(lease, Framing::ContentLength(5), true);
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
        connector.wait_closed(1).await;
        assert_eq!(pool.stats().await.unwrap().idle, 0);
    }

    #[tokio::test]
    async fn dropping_unfinished_body_discards() {
        let connector = ScriptedConnector::new(b"hel");
        let (pool, lease) = scripted_lease(&connector).await;

        let body = Body::from_lease(lease, Framing::ContentLength(5), false);
        drop(body);
        connector.wait_closed(1).await;
        assert_eq!(pool.stats().await.unwrap().idle, 0);
    }
}
