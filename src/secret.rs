//! Secret storage used for TLS material and upstream passwords.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;

/// Secret lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("secret {name} is not usable: {reason}")]
    Invalid { name: String, reason: String },
    #[error("failed to read secret {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl SecretError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SecretError::NotFound(_))
    }
}

/// Secret payload.
#[derive(Clone, PartialEq, Eq)]
pub enum SecretData {
    /// An opaque value such as a password.
    Value(String),
    /// A PEM certificate chain and its private key.
    Tls { cert_pem: String, key_pem: String },
}

// Secret contents never reach logs.
impl std::fmt::Debug for SecretData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretData::Value(_) => f.write_str("Value(..)"),
            SecretData::Tls { .. } => f.write_str("Tls { .. }"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub data: SecretData,
}

impl Secret {
    pub fn value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: SecretData::Value(value.into()),
        }
    }

    pub fn tls(
        name: impl Into<String>,
        cert_pem: impl Into<String>,
        key_pem: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            data: SecretData::Tls {
                cert_pem: cert_pem.into(),
                key_pem: key_pem.into(),
            },
        }
    }

    /// Returns the opaque value, or an error for TLS secrets.
    pub fn as_value(&self) -> Result<&str, SecretError> {
        match &self.data {
            SecretData::Value(v) => Ok(v),
            SecretData::Tls { .. } => Err(SecretError::Invalid {
                name: self.name.clone(),
                reason: "expected a value secret".to_string(),
            }),
        }
    }
}

/// Trait for secret lookup.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<Secret, SecretError>;
}

/// In-process secret store.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<String, Secret>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, secret: Secret) {
        self.secrets.write().insert(secret.name.clone(), secret);
    }

    pub fn remove(&self, name: &str) {
        self.secrets.write().remove(name);
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(&self, name: &str) -> Result<Secret, SecretError> {
        self.secrets
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(name.to_string()))
    }
}

/// Secret store backed by mounted secret directories.
///
/// A secret named `n` lives in `<root>/n/`. A directory holding `tls.crt`
/// and `tls.key` is a TLS secret; one holding `value` is an opaque value.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    root: PathBuf,
}

impl FileSecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_optional(&self, name: &str, file: &str) -> Result<Option<String>, SecretError> {
        match tokio::fs::read_to_string(self.root.join(name).join(file)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SecretError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Secret, SecretError> {
        // Names map straight to directories; refuse anything that could escape the root.
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(SecretError::Invalid {
                name: name.to_string(),
                reason: "invalid secret name".to_string(),
            });
        }

        let cert = self.read_optional(name, "tls.crt").await?;
        let key = self.read_optional(name, "tls.key").await?;
        match (cert, key) {
            (Some(cert_pem), Some(key_pem)) => return Ok(Secret::tls(name, cert_pem, key_pem)),
            (None, None) => {}
            _ => {
                return Err(SecretError::Invalid {
                    name: name.to_string(),
                    reason: "tls.crt and tls.key must both be present".to_string(),
                });
            }
        }

        match self.read_optional(name, "value").await? {
            Some(value) => Ok(Secret::value(name, value.trim_end_matches(['\r', '\n']))),
            None => Err(SecretError::NotFound(name.to_string())),
        }
    }
}
