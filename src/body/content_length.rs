//! Bodies framed by a declared `Content-Length`.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncBufRead, AsyncRead, BufReader, ReadBuf};

use crate::body::BodyBase;
use crate::error::FramingError;
use crate::pool::Lease;

/// Yields exactly `length` bytes, then releases the connection.
pub struct ContentLengthBody {
    base: BodyBase,
    length: u64,
    remaining: u64,
}

impl ContentLengthBody {
    pub fn new(reader: BufReader<Lease>, length: u64, force_close: bool) -> Self {
        let mut base = BodyBase::new(reader, force_close);
        if length == 0 {
            base.finish();
        }
        Self {
            base,
            length,
            remaining: length,
        }
    }

    /// The declared length.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn is_finished(&self) -> bool {
        self.base.is_finished()
    }

    pub fn lease(&self) -> &Lease {
        self.base.lease()
    }
}

impl AsyncRead for ContentLengthBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(settled) = this.base.poll_settled() {
            return settled;
        }
        if this.remaining == 0 {
            this.base.finish();
            return Poll::Ready(Ok(()));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let want = this.remaining.min(buf.remaining() as u64) as usize;
        let read = match ready!(Pin::new(&mut this.base.reader).poll_fill_buf(cx)) {
            Ok([]) => Err(FramingError::UnexpectedEof {
                remaining: this.remaining,
            }
            .into()),
            Ok(available) => {
                let n = available.len().min(want);
                buf.put_slice(&available[..n]);
                Ok(n)
            }
            Err(e) => Err(e),
        };
        let n = match read {
            Ok(n) => n,
            Err(e) => return Poll::Ready(Err(this.base.fail(e))),
        };
        Pin::new(&mut this.base.reader).consume(n);

        this.remaining = match this.remaining.checked_sub(n as u64) {
            Some(remaining) => remaining,
            None => return Poll::Ready(Err(this.base.fail(FramingError::BudgetExceeded.into()))),
        };
        tracing::trace!(connection_id = %this.base.lease().id(), read = n, remaining = this.remaining, "Body read");
        if this.remaining == 0 {
            this.base.finish();
        }
        Poll::Ready(Ok(()))
    }
}
