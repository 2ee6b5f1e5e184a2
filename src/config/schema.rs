//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML. Every section
//! and field has a default, so an empty file is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::addr::{Address, Credentials, ProxyScheme, UpstreamProxy};
use crate::dial::TlsOptions;
use crate::dns::DnsOptions;
use crate::error::TransportError;
use crate::pool::{ManagerOptions, PoolOptions};

/// Root configuration for the transport.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub dial: DialConfig,
    pub dns: DnsConfig,
    pub pool: PoolConfig,
    pub tls: TlsConfig,
    /// Optional upstream proxy every target is reached through.
    pub upstream: Option<UpstreamConfig>,
    pub observability: ObservabilityConfig,
}

/// Outbound dial settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DialConfig {
    /// Per-candidate TCP connect timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl DialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// DNS cache settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DnsConfig {
    /// How long a resolved entry is served, in seconds.
    pub ttl_secs: u64,

    /// Interval between purges of expired entries, in seconds.
    pub refresh_interval_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            refresh_interval_secs: 60,
        }
    }
}

impl From<&DnsConfig> for DnsOptions {
    fn from(config: &DnsConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_secs),
            refresh_interval: Duration::from_secs(config.refresh_interval_secs),
        }
    }
}

/// Connection pool and pool manager settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections older than this are never reused, in milliseconds.
    pub idle_timeout_ms: u64,

    /// Interval between idle-connection GC ticks, in milliseconds.
    pub gc_interval_ms: u64,

    /// Pools without an acquire for this long are removed, in milliseconds.
    pub manager_idle_timeout_ms: u64,

    /// Interval between pool sweeps, in milliseconds.
    pub manager_sweep_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30_000,
            gc_interval_ms: 1_000,
            manager_idle_timeout_ms: 60_000,
            manager_sweep_interval_ms: 10_000,
        }
    }
}

impl From<&PoolConfig> for PoolOptions {
    fn from(config: &PoolConfig) -> Self {
        Self {
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            gc_interval: Duration::from_millis(config.gc_interval_ms),
        }
    }
}

impl From<&PoolConfig> for ManagerOptions {
    fn from(config: &PoolConfig) -> Self {
        Self {
            idle_timeout: Duration::from_millis(config.manager_idle_timeout_ms),
            sweep_interval: Duration::from_millis(config.manager_sweep_interval_ms),
        }
    }
}

/// Client TLS settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    /// Verify origin certificates against the bundled web PKI roots.
    pub verify_certificates: bool,

    /// ALPN protocols offered during the handshake.
    pub alpn: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verify_certificates: true,
            alpn: vec!["http/1.1".to_string()],
        }
    }
}

impl From<&TlsConfig> for TlsOptions {
    fn from(config: &TlsConfig) -> Self {
        Self {
            verify_certificates: config.verify_certificates,
            alpn: config.alpn.iter().map(|p| p.as_bytes().to_vec()).collect(),
        }
    }
}

/// How targets are reached.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
    #[default]
    Direct,
    Http,
    Socks5,
}

/// Upstream proxy settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(default)]
pub struct UpstreamConfig {
    pub scheme: UpstreamScheme,

    /// Proxy address as `host:port`.
    pub address: String,

    pub username: Option<String>,
    pub password: Option<String>,
}

impl UpstreamConfig {
    /// The proxy hop described by this section; `None` for direct connections.
    pub fn to_proxy(&self) -> Result<Option<UpstreamProxy>, TransportError> {
        let scheme = match self.scheme {
            UpstreamScheme::Direct => return Ok(None),
            UpstreamScheme::Http => ProxyScheme::Http,
            UpstreamScheme::Socks5 => ProxyScheme::Socks5,
        };
        let credentials = self.username.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: self.password.clone().unwrap_or_default(),
        });
        Ok(Some(UpstreamProxy {
            scheme,
            address: self.address.parse::<Address>()?,
            credentials,
        }))
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level or `EnvFilter` directive (e.g. `info,proxy_transport=debug`).
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}
