//! Direct TCP dialing.
//!
//! # Responsibilities
//! - Resolve the host through the DNS cache
//! - Try each candidate sequentially, first success wins
//! - Bound every attempt by the dial timeout and the caller's context

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time;

use crate::addr::Address;
use crate::context::Context;
use crate::dial::Dialer;
use crate::dns::DnsCache;
use crate::error::{TransportError, TransportResult};
use crate::net::Connection;

/// Dials origin servers (or proxies) directly over TCP.
#[derive(Clone)]
pub struct BaseDialer {
    dns: DnsCache,
    timeout: Duration,
}

impl BaseDialer {
    pub fn new(dns: DnsCache, timeout: Duration) -> Self {
        Self { dns, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Dial with an explicit per-attempt timeout.
    pub async fn dial_with_timeout(
        &self,
        ctx: &Context,
        addr: &Address,
        timeout: Duration,
    ) -> TransportResult<Connection> {
        let ips = self.dns.lookup(ctx, addr.host()).await?;
        if ips.is_empty() {
            return Err(TransportError::NoAddresses {
                host: addr.host().to_string(),
            });
        }

        let candidates: Vec<SocketAddr> = ips
            .into_iter()
            .map(|ip| SocketAddr::new(ip, addr.port()))
            .collect();
        let stream = connect_first(ctx, &addr.to_string(), &candidates, timeout).await?;
        Ok(Connection::new(addr.clone(), stream))
    }
}

#[async_trait]
impl Dialer for BaseDialer {
    async fn dial(&self, ctx: &Context, addr: &Address) -> TransportResult<Connection> {
        self.dial_with_timeout(ctx, addr, self.timeout).await
    }
}

/// Connect to the candidates in order and return the first stream that opens.
///
/// Attempts are sequential. A failed attempt's socket is dropped before the
/// next one starts; remaining candidates are not touched after a success.
pub async fn connect_first(
    ctx: &Context,
    label: &str,
    candidates: &[SocketAddr],
    timeout: Duration,
) -> TransportResult<TcpStream> {
    let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no candidate addresses");

    for (attempt, candidate) in candidates.iter().enumerate() {
        let started = Instant::now();
        match ctx.run(time::timeout(timeout, TcpStream::connect(*candidate))).await? {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::trace!(addr = %candidate, error = %e, "Failed to set TCP_NODELAY");
                }
                tracing::debug!(
                    target_addr = %label,
                    addr = %candidate,
                    attempt = attempt + 1,
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Dialed"
                );
                return Ok(stream);
            }
            Ok(Err(e)) => {
                tracing::debug!(addr = %candidate, error = %e, "Dial attempt failed");
                last_error = e;
            }
            Err(_) => {
                tracing::debug!(
                    addr = %candidate,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Dial attempt timed out"
                );
                last_error = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
            }
        }
    }

    tracing::warn!(target_addr = %label, attempts = candidates.len(), error = %last_error, "All dial attempts failed");
    Err(TransportError::Dial {
        addr: label.to_string(),
        attempts: candidates.len(),
        source: last_error,
    })
}
