//! TLS client upgrade for established transport connections.
//!
//! # Responsibilities
//! - Keep one rustls client config per host so session tickets are reused
//! - Run the handshake under the caller's context
//! - Hand the raw connection back on handshake failure; the caller closes it

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::Resumption;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::context::Context;
use crate::error::TransportError;
use crate::net::Connection;

/// Session cache entries per host config.
const SESSION_CACHE_SIZE: usize = 64;

/// TLS settings shared by every upgrade.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Verify server certificates against the webpki roots.
    pub verify_certificates: bool,
    /// ALPN protocols to offer.
    pub alpn: Vec<Vec<u8>>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            verify_certificates: true,
            alpn: vec![b"http/1.1".to_vec()],
        }
    }
}

/// A failed upgrade. `connection` is still open when the handshake itself
/// failed, and `None` when the context ended and the socket was dropped.
pub struct UpgradeFailure {
    pub error: TransportError,
    pub connection: Option<Connection>,
}

impl fmt::Debug for UpgradeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeFailure")
            .field("error", &self.error)
            .field("connection", &self.connection.as_ref().map(Connection::id))
            .finish()
    }
}

/// Wraps connections in client-side TLS.
pub struct TlsUpgrader {
    options: TlsOptions,
    provider: Arc<CryptoProvider>,
    roots: Arc<RootCertStore>,
    configs: DashMap<String, Arc<ClientConfig>>,
}

impl TlsUpgrader {
    pub fn new(options: TlsOptions) -> Self {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self {
            options,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            roots: Arc::new(roots),
            configs: DashMap::new(),
        }
    }

    /// The client config used for `host`, built on first use.
    pub fn config_for(&self, host: &str) -> Result<Arc<ClientConfig>, TransportError> {
        if let Some(config) = self.configs.get(host) {
            return Ok(config.clone());
        }

        let builder = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?;
        let mut config = if self.options.verify_certificates {
            builder
                .with_root_certificates(self.roots.clone())
                .with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification {
                    schemes: self
                        .provider
                        .signature_verification_algorithms
                        .supported_schemes(),
                }))
                .with_no_client_auth()
        };
        config.alpn_protocols = self.options.alpn.clone();
        config.resumption = Resumption::in_memory_sessions(SESSION_CACHE_SIZE);

        let config = Arc::new(config);
        Ok(self
            .configs
            .entry(host.to_string())
            .or_insert(config)
            .clone())
    }

    /// Number of hosts with a cached client config.
    pub fn cached_hosts(&self) -> usize {
        self.configs.len()
    }

    /// Perform the client handshake over `conn`.
    pub async fn upgrade(
        &self,
        ctx: &Context,
        conn: Connection,
        host: &str,
    ) -> Result<Connection, UpgradeFailure> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let server_name = match ServerName::try_from(host.to_string()) {
            Ok(name) => name,
            Err(_) => {
                return Err(UpgradeFailure {
                    error: TransportError::InvalidServerName {
                        host: host.to_string(),
                    },
                    connection: Some(conn),
                })
            }
        };
        let config = match self.config_for(host) {
            Ok(config) => config,
            Err(error) => {
                return Err(UpgradeFailure {
                    error,
                    connection: Some(conn),
                })
            }
        };

        let (id, peer, stream) = conn.into_parts();
        let handshake = TlsConnector::from(config)
            .connect(server_name, stream)
            .into_fallible();

        // Dropping the handshake on cancellation drops the socket with it.
        match ctx.run(handshake).await {
            Err(error) => {
                tracing::debug!(host = %host, connection_id = %id, error = %error, "TLS handshake abandoned");
                Err(UpgradeFailure {
                    error,
                    connection: None,
                })
            }
            Ok(Err((source, stream))) => {
                tracing::warn!(host = %host, connection_id = %id, error = %source, "TLS handshake failed");
                Err(UpgradeFailure {
                    error: TransportError::Tls {
                        host: host.to_string(),
                        source,
                    },
                    connection: Some(Connection::from_parts(id, peer, stream)),
                })
            }
            Ok(Ok(tls)) => {
                let (_, session) = tls.get_ref();
                tracing::debug!(
                    host = %host,
                    connection_id = %id,
                    alpn = ?session.alpn_protocol().map(String::from_utf8_lossy),
                    "TLS established"
                );
                Ok(Connection::from_parts(id, peer, tls))
            }
        }
    }
}

impl Default for TlsUpgrader {
    fn default() -> Self {
        Self::new(TlsOptions::default())
    }
}

/// Accepts any server certificate. Only installed when verification is disabled.
#[derive(Debug)]
struct SkipServerVerification {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
