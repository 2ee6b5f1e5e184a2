//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (durations > 0, GC faster than idle timeout)
//! - Check the upstream section is usable for its scheme
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TransportConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use tracing_subscriber::EnvFilter;

use crate::addr::Address;
use crate::config::schema::{TransportConfig, UpstreamScheme};

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check every semantic rule and report all violations.
pub fn validate_config(config: &TransportConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let positive = [
        ("dial.timeout_secs", config.dial.timeout_secs),
        ("dns.ttl_secs", config.dns.ttl_secs),
        ("dns.refresh_interval_secs", config.dns.refresh_interval_secs),
        ("pool.idle_timeout_ms", config.pool.idle_timeout_ms),
        ("pool.gc_interval_ms", config.pool.gc_interval_ms),
        ("pool.manager_idle_timeout_ms", config.pool.manager_idle_timeout_ms),
        ("pool.manager_sweep_interval_ms", config.pool.manager_sweep_interval_ms),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than zero"));
        }
    }

    let pool = &config.pool;
    if pool.gc_interval_ms > 0 && pool.gc_interval_ms >= pool.idle_timeout_ms {
        errors.push(ValidationError::new(
            "pool.gc_interval_ms",
            format!(
                "must be shorter than pool.idle_timeout_ms ({})",
                pool.idle_timeout_ms
            ),
        ));
    }

    for protocol in &config.tls.alpn {
        if protocol.is_empty() || protocol.len() > 255 {
            errors.push(ValidationError::new(
                "tls.alpn",
                format!("protocol {protocol:?} must be 1 to 255 bytes"),
            ));
        }
    }

    if let Some(upstream) = &config.upstream {
        if upstream.password.is_some() && upstream.username.is_none() {
            errors.push(ValidationError::new(
                "upstream.password",
                "password given without username",
            ));
        }
        match upstream.scheme {
            UpstreamScheme::Direct => {
                if upstream.username.is_some() {
                    errors.push(ValidationError::new(
                        "upstream.username",
                        "credentials require an http or socks5 scheme",
                    ));
                }
            }
            UpstreamScheme::Http | UpstreamScheme::Socks5 => {
                if let Err(e) = upstream.address.parse::<Address>() {
                    errors.push(ValidationError::new("upstream.address", e.to_string()));
                }
            }
        }
    }

    if EnvFilter::try_new(&config.observability.log_level).is_err() {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("invalid filter {:?}", config.observability.log_level),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
