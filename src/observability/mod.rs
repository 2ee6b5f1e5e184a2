//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields
//!       (target, connection_id, elapsed_ms, ...)
//!
//! Consumers:
//!     → logging.rs subscriber (stderr, filtered by RUST_LOG or config)
//! ```
//!
//! # Design Decisions
//! - debug for per-connection lifecycle, info for pool lifecycle,
//!   warn for dial, handshake and framing failures, trace for per-read detail
//! - Connection IDs flow through every event about a connection

pub mod logging;

pub use logging::init_tracing;
