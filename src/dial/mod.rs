//! Outbound dialing subsystem.
//!
//! # Data Flow
//! ```text
//! Connector::connect(target)
//!     → dialer_for(target.upstream):
//!         - base.rs (DNS lookup → sequential TCP attempts)
//!         - http_connect.rs (base → proxy, CONNECT handshake)
//!         - socks5.rs (base → proxy, SOCKS5 handshake)
//!     → tls.rs (optional client handshake, per-host session cache)
//!     → Connection
//! ```
//!
//! # Design Decisions
//! - Tunnel dialers decorate an inner `Dialer`; callers cannot tell a tunneled
//!   connection from a direct one
//! - No retries here; retry policy belongs to the layer above
//! - Sequential candidate attempts bound socket usage per dial

use async_trait::async_trait;

use crate::addr::{Address, Target};
use crate::context::Context;
use crate::error::TransportResult;
use crate::net::Connection;

pub mod base;
pub mod connector;
pub mod http_connect;
pub mod socks5;
pub mod tls;

pub use base::BaseDialer;
pub use connector::Connector;
pub use http_connect::HttpConnectDialer;
pub use socks5::Socks5Dialer;
pub use tls::{TlsOptions, TlsUpgrader, UpgradeFailure};

/// Opens a transport connection to one address.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, ctx: &Context, addr: &Address) -> TransportResult<Connection>;
}

/// Opens a ready-to-use connection for a full target (tunnel + TLS included).
///
/// Connection pools dial through this trait.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    async fn connect(&self, ctx: &Context, target: &Target) -> TransportResult<Connection>;
}
