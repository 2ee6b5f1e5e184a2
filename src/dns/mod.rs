//! DNS resolution subsystem.
//!
//! # Data Flow
//! ```text
//! BaseDialer::dial(host)
//!     → cache.rs (IP literal? return as-is)
//!     → cache.rs actor (fresh entry? reply)
//!     → resolver.rs (miss or expired: one resolve per host, waiters coalesced)
//!     → shuffled copy returned to the caller
//! ```
//!
//! # Design Decisions
//! - Explicitly constructed and injected; no process-global resolver
//! - Entries are replaced wholesale, never patched
//! - Stale entries are never served past their TTL
//! - Shuffling happens on the caller side, per lookup

pub mod cache;
pub mod resolver;

pub use cache::{DnsCache, DnsOptions};
pub use resolver::{Resolve, StaticResolver, SystemResolver};
