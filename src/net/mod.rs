//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! dial (TCP / tunnel / TLS)
//!     → connection.rs (id + peer + type-erased stream)
//!     → pool (idle ↔ checked out)
//!     → body readers
//!
//! Connection States:
//!     Idle-in-pool ↔ Checked-out → Closed
//! ```
//!
//! # Design Decisions
//! - Every stream variant is boxed behind `AsyncStream` so pools and readers
//!   never care how the bytes got there
//! - Connection IDs survive tunneling and TLS upgrades

pub mod connection;
pub mod prebuffered;

pub use connection::{AsyncStream, Connection, ConnectionId};
pub use prebuffered::Prebuffered;
