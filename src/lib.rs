//! Outbound transport for an intercepting HTTP/HTTPS proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!   executor
//!      │ Transport::connect(ctx, target)
//!      ▼
//!   ┌──────────────┐   ┌────────────────┐   ┌──────────────────────────────┐
//!   │ pool manager │──▶│ pool (per      │──▶│ Connector                     │
//!   │   (actor)    │   │ target, actor) │   │  dns cache → base dialer      │
//!   └──────────────┘   └───────┬────────┘   │  → CONNECT / SOCKS5 tunnel    │
//!                              │            │  → TLS upgrade                │
//!                              ▼            └──────────────────────────────┘
//!                           Lease ──▶ ResponseHead ──▶ Body
//!                              ▲                        │
//!                              └──── release / discard ◀┘
//! ```
//!
//! Header parsing for production traffic belongs to the caller; this crate
//! supplies the byte stream and the framing-aware body readers.

pub mod addr;
pub mod body;
pub mod config;
pub mod context;
pub mod dial;
pub mod dns;
pub mod error;
pub mod net;
pub mod observability;
pub mod pool;
pub mod transport;

pub use addr::{Address, Target, UpstreamProxy};
pub use body::{Body, Framing};
pub use config::TransportConfig;
pub use context::Context;
pub use error::{FramingError, TransportError, TransportResult};
pub use pool::Lease;
pub use transport::Transport;
