//! Cluster certificate rotation.
//!
//! The live [`ServerConfig`] is built once and never swapped on rotation.
//! Its certificate resolver asks a [`CertificateSource`] on every handshake,
//! so installing a new certificate only changes what later handshakes see.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::RwLock;
use rustls::ServerConfig;
use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::info;

use crate::secret::{Secret, SecretData};

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("invalid certificate material in secret {name}: {reason}")]
    InvalidMaterial { name: String, reason: String },
    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
}

/// Read side of the TLS identity, consulted once per handshake.
pub trait CertificateSource: Debug + Send + Sync {
    fn current_certificate(&self) -> Option<Arc<CertifiedKey>>;
}

/// Holds the installed certificate.
///
/// Handshakes take a read lock and clone the `Arc`, so a handshake keeps
/// the certificate it started with even if a rotation lands mid-flight.
#[derive(Debug, Default)]
pub struct CertificateHolder {
    current: RwLock<Option<Arc<CertifiedKey>>>,
}

impl CertificateHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, key: Option<Arc<CertifiedKey>>) {
        *self.current.write() = key;
    }
}

impl CertificateSource for CertificateHolder {
    fn current_certificate(&self) -> Option<Arc<CertifiedKey>> {
        self.current.read().clone()
    }
}

/// Resolver handed to rustls. Returning `None` fails the handshake inside
/// rustls; nothing here treats a missing certificate as an error.
#[derive(Debug)]
struct CurrentCertificate {
    source: Arc<dyn CertificateSource>,
}

impl ResolvesServerCert for CurrentCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.source.current_certificate()
    }
}

/// Owns the cluster certificate and builds the live TLS configuration.
#[derive(Debug)]
pub struct CredentialManager {
    holder: Arc<CertificateHolder>,
    provider: Arc<CryptoProvider>,
}

impl Default for CredentialManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialManager {
    pub fn new() -> Self {
        Self {
            holder: Arc::new(CertificateHolder::new()),
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }

    /// Replaces the installed certificate. `None` uninstalls it.
    ///
    /// Material is parsed before the write lock is taken; on error the
    /// previous certificate stays installed.
    pub fn set_cluster_certificate(&self, secret: Option<&Secret>) -> Result<(), TlsError> {
        let key = secret
            .map(|secret| certified_key(secret, &self.provider))
            .transpose()?;
        if let Some(secret) = secret {
            info!(secret = %secret.name, "Installing cluster certificate");
        }
        self.holder.install(key);
        Ok(())
    }

    pub fn current_certificate(&self) -> Option<Arc<CertifiedKey>> {
        self.holder.current_certificate()
    }

    /// Builds a TLS 1.2-1.3 server configuration without client
    /// authentication whose certificate tracks this manager.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, TlsError> {
        let config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(CurrentCertificate {
                source: self.holder.clone(),
            }));
        Ok(Arc::new(config))
    }
}

/// Parses a TLS secret into a signing-ready certificate.
pub fn certified_key(
    secret: &Secret,
    provider: &CryptoProvider,
) -> Result<Arc<CertifiedKey>, TlsError> {
    let invalid = |reason: String| TlsError::InvalidMaterial {
        name: secret.name.clone(),
        reason,
    };

    let SecretData::Tls { cert_pem, key_pem } = &secret.data else {
        return Err(invalid("not a TLS secret".to_string()));
    };

    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid(e.to_string()))?;
    if certs.is_empty() {
        return Err(invalid("no certificate found".to_string()));
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| invalid(e.to_string()))?
        .ok_or_else(|| invalid("no private key found".to_string()))?;
    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|e| invalid(e.to_string()))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}
