//! HTTP CONNECT tunneling through an upstream proxy.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::addr::{Address, Credentials};
use crate::context::Context;
use crate::dial::Dialer;
use crate::error::{TransportError, TransportResult};
use crate::net::{Connection, Prebuffered};

/// Upper bound on the proxy's response head.
pub const MAX_CONNECT_RESPONSE_BYTES: usize = 8 * 1024;

const MAX_CONNECT_RESPONSE_HEADERS: usize = 32;

/// Reaches a destination by tunneling through an HTTP proxy.
pub struct HttpConnectDialer {
    inner: Arc<dyn Dialer>,
    proxy: Address,
    credentials: Option<Credentials>,
}

impl HttpConnectDialer {
    pub fn new(inner: Arc<dyn Dialer>, proxy: Address, credentials: Option<Credentials>) -> Self {
        Self {
            inner,
            proxy,
            credentials,
        }
    }

    async fn handshake(&self, conn: Connection, destination: &Address) -> TransportResult<Connection> {
        let (id, _proxy, mut stream) = conn.into_parts();
        let handshake_err = |source| TransportError::TunnelHandshake {
            proxy: self.proxy.to_string(),
            source,
        };

        let request = connect_request(destination, self.credentials.as_ref());
        stream.write_all(request.as_bytes()).await.map_err(handshake_err)?;
        stream.flush().await.map_err(handshake_err)?;

        let mut buf = BytesMut::with_capacity(1024);
        let (status, head_len) = loop {
            if buf.len() >= MAX_CONNECT_RESPONSE_BYTES {
                return Err(handshake_err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "CONNECT response head too large",
                )));
            }
            let n = (&mut stream)
                .take((MAX_CONNECT_RESPONSE_BYTES - buf.len()) as u64)
                .read_buf(&mut buf)
                .await
                .map_err(handshake_err)?;
            if n == 0 {
                return Err(handshake_err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "proxy closed connection during CONNECT",
                )));
            }
            if let Some(parsed) = parse_connect_response(&buf).map_err(handshake_err)? {
                break parsed;
            }
        };

        if status != 200 {
            tracing::warn!(proxy = %self.proxy, destination = %destination, status, "Tunnel rejected");
            return Err(TransportError::TunnelRejected {
                proxy: self.proxy.to_string(),
                status,
            });
        }

        let early: Bytes = buf.split_off(head_len).freeze();
        tracing::debug!(
            proxy = %self.proxy,
            destination = %destination,
            connection_id = %id,
            early_bytes = early.len(),
            "Tunnel established"
        );
        Ok(Connection::from_parts(
            id,
            destination.clone(),
            Prebuffered::new(early, stream),
        ))
    }
}

#[async_trait]
impl Dialer for HttpConnectDialer {
    async fn dial(&self, ctx: &Context, destination: &Address) -> TransportResult<Connection> {
        let conn = self.inner.dial(ctx, &self.proxy).await?;
        ctx.run(self.handshake(conn, destination)).await?
    }
}

/// The literal CONNECT request sent to the proxy.
pub fn connect_request(destination: &Address, credentials: Option<&Credentials>) -> String {
    let mut request = format!("CONNECT {destination} HTTP/1.1\r\nHost: {destination}\r\n");
    if let Some(creds) = credentials {
        let token = STANDARD.encode(format!("{}:{}", creds.username, creds.password));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    request
}

/// Parse the status line and headers; `None` while incomplete.
fn parse_connect_response(buf: &[u8]) -> io::Result<Option<(u16, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_CONNECT_RESPONSE_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let status = response.code.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "CONNECT response without status")
            })?;
            Ok(Some((status, len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
    }
}
