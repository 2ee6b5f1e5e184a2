//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → TransportConfig (validated, immutable)
//!     → From impls → DnsOptions / PoolOptions / ManagerOptions / TlsOptions
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; a new transport is built for new settings
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Runtime components take option structs, never the raw config

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    DialConfig, DnsConfig, ObservabilityConfig, PoolConfig, TlsConfig, TransportConfig,
    UpstreamConfig, UpstreamScheme,
};
pub use validation::{validate_config, ValidationError};
