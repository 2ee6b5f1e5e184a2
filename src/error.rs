//! Error taxonomy for the transport layer.
//!
//! Dial-time and handshake-time failures are returned as [`TransportError`].
//! Body-streaming failures surface as `std::io::Error` from the body readers,
//! wrapping a [`FramingError`] that callers can recover with
//! [`FramingError::from_io`].

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors produced while resolving, dialing, tunneling or upgrading a connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The system resolver failed and no cached entry is still valid.
    #[error("DNS resolution failed for {host}: {source}")]
    Dns {
        host: String,
        #[source]
        source: io::Error,
    },

    /// The resolver succeeded but returned no addresses.
    #[error("no addresses found for {host}")]
    NoAddresses { host: String },

    /// Every candidate address was tried and none accepted the connection.
    #[error("failed to dial {addr} after {attempts} attempt(s): {source}")]
    Dial {
        addr: String,
        attempts: usize,
        #[source]
        source: io::Error,
    },

    /// The dial chain (connect, tunnel handshake, TLS) outlived the dial timeout.
    #[error("dialing {target} timed out after {timeout:?}")]
    DialTimeout { target: String, timeout: Duration },

    /// The upstream proxy answered the CONNECT request with a non-200 status.
    #[error("upstream proxy {proxy} rejected tunnel with status {status}")]
    TunnelRejected { proxy: String, status: u16 },

    /// The CONNECT exchange itself failed (I/O error or unparsable response).
    #[error("tunnel handshake with {proxy} failed: {source}")]
    TunnelHandshake {
        proxy: String,
        #[source]
        source: io::Error,
    },

    /// SOCKS5 negotiation with the upstream proxy failed.
    #[error("SOCKS5 handshake with {proxy} failed: {source}")]
    Socks {
        proxy: String,
        #[source]
        source: tokio_socks::Error,
    },

    /// The destination host is not a valid TLS server name.
    #[error("invalid TLS server name: {host}")]
    InvalidServerName { host: String },

    /// TLS client configuration could not be built.
    #[error("TLS configuration error: {0}")]
    TlsConfig(#[from] rustls::Error),

    /// The TLS handshake failed.
    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: io::Error,
    },

    /// The governing context was canceled.
    #[error("operation canceled")]
    Canceled,

    /// The governing context's deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The pool for this target has shut down.
    #[error("connection pool for {target} is closed")]
    PoolClosed { target: String },

    /// An address string could not be parsed.
    #[error("invalid address {input:?}: {reason}")]
    InvalidAddress { input: String, reason: &'static str },

    /// Generic I/O failure outside of the categories above.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether the error came from the caller's context rather than the network.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded)
    }
}

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Body framing faults. Any of these forces the connection to be discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// A byte in the chunk-size position is not a hex digit.
    #[error("invalid byte 0x{byte:02x} in chunk size line")]
    InvalidChunkSize { byte: u8 },

    /// The chunk-size line had no hex digits at all.
    #[error("empty chunk size")]
    EmptyChunkSize,

    /// More hex digits than the decoder accepts.
    #[error("chunk size has too many digits")]
    ChunkSizeTooLong,

    /// The chunk size does not fit in a `u64`.
    #[error("chunk size overflows u64")]
    ChunkSizeOverflow,

    /// A CRLF delimiter was expected.
    #[error("expected CRLF, found 0x{found:02x}")]
    MissingCrlf { found: u8 },

    /// The trailer section exceeded the decoder's limit.
    #[error("chunked trailer section too large")]
    TrailerTooLarge,

    /// The stream ended before the declared framing was complete.
    #[error("connection closed with {remaining} body byte(s) outstanding")]
    UnexpectedEof { remaining: u64 },

    /// More bytes were produced than the content length allows.
    #[error("content length budget exceeded")]
    BudgetExceeded,
}

impl FramingError {
    /// Recover a framing error from an I/O error returned by a body reader.
    pub fn from_io(err: &io::Error) -> Option<&FramingError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<FramingError>())
    }
}

impl From<FramingError> for io::Error {
    fn from(err: FramingError) -> Self {
        let kind = match err {
            FramingError::UnexpectedEof { .. } => io::ErrorKind::UnexpectedEof,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_error_survives_io_conversion() {
        let err: io::Error = FramingError::InvalidChunkSize { byte: b'z' }.into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(
            FramingError::from_io(&err),
            Some(&FramingError::InvalidChunkSize { byte: b'z' })
        );
    }

    #[test]
    fn eof_maps_to_unexpected_eof_kind() {
        let err: io::Error = FramingError::UnexpectedEof { remaining: 3 }.into();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn cancellation_classification() {
        assert!(TransportError::Canceled.is_cancellation());
        assert!(TransportError::DeadlineExceeded.is_cancellation());
        assert!(!TransportError::NoAddresses { host: "x".into() }.is_cancellation());
    }
}
