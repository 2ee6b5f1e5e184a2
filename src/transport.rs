//! Transport facade handed to the request executor.
//!
//! Owns the DNS cache, the dial chain and the pool manager, and ties their
//! lifetimes to one cancellation token.

use std::sync::Arc;

use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

use crate::addr::{Address, Target, UpstreamProxy};
use crate::body::{Body, Framing};
use crate::config::TransportConfig;
use crate::context::Context;
use crate::dial::{BaseDialer, Connector, TlsUpgrader};
use crate::dns::{DnsCache, Resolve, SystemResolver};
use crate::error::TransportResult;
use crate::pool::{Lease, PoolManager};

pub struct Transport {
    dns: DnsCache,
    connector: Arc<Connector>,
    manager: PoolManager,
    upstream: Option<UpstreamProxy>,
    shutdown: CancellationToken,
}

impl Transport {
    /// Build a transport that resolves through the operating system.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(config: &TransportConfig) -> TransportResult<Self> {
        Self::with_resolver(config, Arc::new(SystemResolver))
    }

    pub fn with_resolver(config: &TransportConfig, resolver: Arc<dyn Resolve>) -> TransportResult<Self> {
        let upstream = match &config.upstream {
            Some(upstream) => upstream.to_proxy()?,
            None => None,
        };

        let shutdown = CancellationToken::new();
        let dns = DnsCache::spawn(resolver, (&config.dns).into(), shutdown.child_token());
        let connector = Arc::new(Connector::new(
            BaseDialer::new(dns.clone(), config.dial.timeout()),
            TlsUpgrader::new((&config.tls).into()),
        ));
        let manager = PoolManager::spawn(
            connector.clone(),
            (&config.pool).into(),
            (&config.pool).into(),
            shutdown.child_token(),
        );

        tracing::info!(
            upstream = ?upstream.as_ref().map(|u| u.address.to_string()),
            dial_timeout_secs = config.dial.timeout_secs,
            verify_certificates = config.tls.verify_certificates,
            "Transport started"
        );

        Ok(Self {
            dns,
            connector,
            manager,
            upstream,
            shutdown,
        })
    }

    /// Target for `destination` through the configured upstream, if any.
    pub fn target(&self, destination: Address, tls: bool) -> Target {
        let target = if tls {
            Target::tls(destination)
        } else {
            Target::plain(destination)
        };
        target.via(self.upstream.clone())
    }

    /// Check out a connection for `target`: pooled if one is idle, dialed otherwise.
    pub async fn connect(&self, ctx: &Context, target: &Target) -> TransportResult<Lease> {
        self.manager.acquire(ctx, target).await
    }

    /// Wrap a connection whose response head was already read in a body reader.
    pub fn open_body(&self, reader: BufReader<Lease>, framing: Framing, force_close: bool) -> Body {
        Body::new(reader, framing, force_close)
    }

    pub fn dns(&self) -> &DnsCache {
        &self.dns
    }

    pub fn tls(&self) -> &TlsUpgrader {
        self.connector.tls()
    }

    /// Targets that currently have a connection pool.
    pub async fn pool_targets(&self) -> Vec<Target> {
        self.manager.targets().await
    }

    /// Close every pooled connection and stop the background tasks.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        self.shutdown.cancel();
        tracing::info!("Transport shut down");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
