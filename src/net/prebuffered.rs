//! A stream that replays already-read bytes before its inner stream.
//!
//! Used when a handshake reader pulled more bytes off the wire than the
//! handshake itself needed (e.g. a proxy that sends data right after
//! `200 Connection established`).

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub struct Prebuffered<S> {
    buf: Bytes,
    inner: S,
}

impl<S> Prebuffered<S> {
    pub fn new(buf: Bytes, inner: S) -> Self {
        Self { buf, inner }
    }

    /// Bytes not yet handed to a reader.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prebuffered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            out.put_slice(&self.buf[..n]);
            self.buf.advance(n);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prebuffered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn replays_buffer_then_inner() {
        let mut p = Prebuffered::new(Bytes::from_static(b"hello "), Cursor::new(b"world".to_vec()));
        let mut out = Vec::new();
        p.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
        assert!(p.buffered().is_empty());
    }

    #[tokio::test]
    async fn partial_reads_drain_buffer_first() {
        let mut p = Prebuffered::new(Bytes::from_static(b"abcd"), Cursor::new(b"ef".to_vec()));
        let mut buf = [0u8; 3];
        let n = p.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");
        assert_eq!(p.buffered(), b"d");

        let mut rest = Vec::new();
        p.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"def");
    }

    #[tokio::test]
    async fn empty_buffer_falls_through() {
        let mut p = Prebuffered::new(Bytes::new(), Cursor::new(b"xyz".to_vec()));
        let mut out = Vec::new();
        p.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"xyz");
    }
}
