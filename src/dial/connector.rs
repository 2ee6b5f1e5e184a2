//! Composition of the dial chain for a [`Target`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::addr::{ProxyScheme, Target};
use crate::context::Context;
use crate::dial::{BaseDialer, Connect, Dialer, HttpConnectDialer, Socks5Dialer, TlsUpgrader};
use crate::error::{TransportError, TransportResult};
use crate::net::Connection;

/// Picks the tunnel for a target's upstream proxy, then applies TLS if asked.
#[derive(Clone)]
pub struct Connector {
    base: Arc<BaseDialer>,
    tls: Arc<TlsUpgrader>,
}

impl Connector {
    pub fn new(base: BaseDialer, tls: TlsUpgrader) -> Self {
        Self {
            base: Arc::new(base),
            tls: Arc::new(tls),
        }
    }

    pub fn tls(&self) -> &TlsUpgrader {
        &self.tls
    }

    /// The dialer that reaches `target.destination`, tunneled or not.
    pub fn dialer_for(&self, target: &Target) -> Arc<dyn Dialer> {
        let base: Arc<dyn Dialer> = self.base.clone();
        match &target.upstream {
            None => base,
            Some(proxy) => match proxy.scheme {
                ProxyScheme::Http => Arc::new(HttpConnectDialer::new(
                    base,
                    proxy.address.clone(),
                    proxy.credentials.clone(),
                )),
                ProxyScheme::Socks5 => Arc::new(Socks5Dialer::new(
                    base,
                    proxy.address.clone(),
                    proxy.credentials.clone(),
                )),
            },
        }
    }

    async fn connect_chain(&self, ctx: &Context, target: &Target) -> TransportResult<Connection> {
        let conn = self.dialer_for(target).dial(ctx, &target.destination).await?;
        if !target.tls {
            return Ok(conn);
        }

        match self.tls.upgrade(ctx, conn, target.destination.host()).await {
            Ok(conn) => Ok(conn),
            Err(failure) => {
                if let Some(conn) = failure.connection {
                    conn.close().await;
                }
                Err(failure.error)
            }
        }
    }
}

#[async_trait]
impl Connect for Connector {
    /// The whole chain shares one dial timeout, so a peer that accepts TCP and
    /// then goes silent cannot hold the calling pool.
    async fn connect(&self, ctx: &Context, target: &Target) -> TransportResult<Connection> {
        let timeout = self.base.timeout();
        let dial_ctx = ctx.with_timeout(timeout);
        match self.connect_chain(&dial_ctx, target).await {
            // Only ours if the caller's own context is still live.
            Err(TransportError::DeadlineExceeded) if ctx.check().is_ok() => {
                tracing::warn!(
                    target = %target,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Dial timed out"
                );
                Err(TransportError::DialTimeout {
                    target: target.to_string(),
                    timeout,
                })
            }
            result => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::UpstreamProxy;
    use crate::dns::{DnsCache, DnsOptions, StaticResolver};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    fn connector() -> Connector {
        connector_with_timeout(Duration::from_secs(2))
    }

    fn connector_with_timeout(timeout: Duration) -> Connector {
        let resolver = StaticResolver::new()
            .with("origin.test", ["127.0.0.1".parse().unwrap()])
            .with("proxy.test", ["127.0.0.1".parse().unwrap()]);
        let dns = DnsCache::spawn(Arc::new(resolver), DnsOptions::default(), CancellationToken::new());
        Connector::new(BaseDialer::new(dns, timeout), TlsUpgrader::default())
    }

    /// Accepts connections and never writes a byte.
    async fn silent_listener() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });
        port
    }

    #[tokio::test]
    async fn plain_target_is_direct_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"hi").await.unwrap();
        });

        let target = Target::plain(format!("origin.test:{port}").parse().unwrap());
        let mut conn = connector().connect(&Context::background(), &target).await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn tls_failure_closes_connection_and_reports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = sock.write_all(b"not tls at all\r\n\r\n").await;
            let mut rest = Vec::new();
            // Returns once the client side closes.
            let _ = sock.read_to_end(&mut rest).await;
        });

        let target = Target::tls(format!("origin.test:{port}").parse().unwrap());
        let err = connector()
            .connect(&Context::background(), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Tls { .. }));
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("server never saw the close")
            .unwrap();
    }

    #[tokio::test]
    async fn silent_connect_proxy_hits_dial_timeout() {
        let proxy_port = silent_listener().await;
        let proxy = UpstreamProxy {
            scheme: ProxyScheme::Http,
            address: format!("proxy.test:{proxy_port}").parse().unwrap(),
            credentials: None,
        };
        let target = Target::plain("origin.test:80".parse().unwrap()).via(Some(proxy));

        let started = tokio::time::Instant::now();
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            connector_with_timeout(Duration::from_millis(200)).connect(&Context::background(), &target),
        )
        .await
        .expect("dial was not bounded by the dial timeout")
        .unwrap_err();
        assert!(matches!(err, TransportError::DialTimeout { .. }), "unexpected error: {err}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn silent_tls_origin_hits_dial_timeout() {
        let port = silent_listener().await;
        let target = Target::tls(format!("origin.test:{port}").parse().unwrap());

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            connector_with_timeout(Duration::from_millis(200)).connect(&Context::background(), &target),
        )
        .await
        .expect("handshake was not bounded by the dial timeout")
        .unwrap_err();
        assert!(matches!(err, TransportError::DialTimeout { .. }), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn caller_deadline_is_reported_as_such() {
        let port = silent_listener().await;
        let target = Target::tls(format!("origin.test:{port}").parse().unwrap());
        let ctx = Context::background().with_timeout(Duration::from_millis(100));

        let err = connector_with_timeout(Duration::from_secs(5))
            .connect(&ctx, &target)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::DeadlineExceeded), "unexpected error: {err}");
    }
}
