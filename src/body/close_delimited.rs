//! Bodies that end when the peer closes the connection.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncBufRead, AsyncRead, BufReader, ReadBuf};

use crate::body::BodyBase;
use crate::pool::Lease;

/// Reads to EOF. The connection is always discarded afterwards.
pub struct CloseDelimitedBody {
    base: BodyBase,
    read: u64,
}

impl CloseDelimitedBody {
    pub fn new(reader: BufReader<Lease>) -> Self {
        Self {
            base: BodyBase::new(reader, true),
            read: 0,
        }
    }

    /// Bytes produced so far.
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    pub fn is_finished(&self) -> bool {
        self.base.is_finished()
    }

    pub fn lease(&self) -> &Lease {
        self.base.lease()
    }
}

impl AsyncRead for CloseDelimitedBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(settled) = this.base.poll_settled() {
            return settled;
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let read = match ready!(Pin::new(&mut this.base.reader).poll_fill_buf(cx)) {
            Ok(available) => {
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                Ok(n)
            }
            Err(e) => Err(e),
        };
        match read {
            Ok(0) => this.base.finish(),
            Ok(n) => {
                Pin::new(&mut this.base.reader).consume(n);
                this.read += n as u64;
            }
            Err(e) => return Poll::Ready(Err(this.base.fail(e))),
        }
        Poll::Ready(Ok(()))
    }
}
