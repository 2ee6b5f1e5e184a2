//! SOCKS5 tunneling through an upstream proxy.
//!
//! The wire protocol is delegated to `tokio-socks`; this dialer only reaches the
//! proxy through the inner dialer and hands the negotiated stream back.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_socks::tcp::Socks5Stream;

use crate::addr::{Address, Credentials};
use crate::context::Context;
use crate::dial::Dialer;
use crate::error::{TransportError, TransportResult};
use crate::net::Connection;

pub struct Socks5Dialer {
    inner: Arc<dyn Dialer>,
    proxy: Address,
    credentials: Option<Credentials>,
}

impl Socks5Dialer {
    pub fn new(inner: Arc<dyn Dialer>, proxy: Address, credentials: Option<Credentials>) -> Self {
        Self {
            inner,
            proxy,
            credentials,
        }
    }
}

#[async_trait]
impl Dialer for Socks5Dialer {
    async fn dial(&self, ctx: &Context, destination: &Address) -> TransportResult<Connection> {
        let conn = self.inner.dial(ctx, &self.proxy).await?;
        let (id, _proxy, stream) = conn.into_parts();
        let target = (destination.host(), destination.port());

        let negotiated = match &self.credentials {
            Some(creds) => {
                ctx.run(Socks5Stream::connect_with_password_and_socket(
                    stream,
                    target,
                    &creds.username,
                    &creds.password,
                ))
                .await?
            }
            None => ctx.run(Socks5Stream::connect_with_socket(stream, target)).await?,
        };

        let socks = negotiated.map_err(|source| {
            tracing::warn!(proxy = %self.proxy, destination = %destination, error = %source, "SOCKS5 handshake failed");
            TransportError::Socks {
                proxy: self.proxy.to_string(),
                source,
            }
        })?;

        tracing::debug!(proxy = %self.proxy, destination = %destination, connection_id = %id, "SOCKS5 tunnel established");
        Ok(Connection::from_parts(id, destination.clone(), socks))
    }
}
