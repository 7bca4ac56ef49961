//! Error types for the supervisor

use std::net::SocketAddr;

use crate::secret::SecretError;
use crate::server::TlsError;

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by `Server::run` and the certificate operations.
/// Per-connection failures never reach this type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The listening port could not be acquired
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// TLS material or configuration is unusable
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// Certificate retrieval failed for a reason other than "not found"
    #[error(transparent)]
    Secret(#[from] SecretError),

    /// No service descriptor is cached
    #[error("service descriptor is not available")]
    ServiceUnavailable,

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is closed")]
    Closed,
}
