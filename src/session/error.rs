use crate::balancer::BalancerError;
use crate::protocol::ProtocolError;
use crate::secret::SecretError;

/// Session establishment and relay errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("TLS handshake failed: {0}")]
    Tls(#[source] std::io::Error),
    #[error("client must negotiate TLS")]
    TlsRequired,
    #[error("cancel requests are not proxied")]
    CancelRequest,
    #[error("client closed the connection during startup")]
    ClientClosed,
    #[error("client did not complete startup in time")]
    StartupTimeout,
    #[error(transparent)]
    Balancer(#[from] BalancerError),
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error("upstream requested a password but none is configured")]
    PasswordUnavailable,
    #[error("upstream rejected the session: {0}")]
    UpstreamRejected(String),
    #[error("unsupported upstream authentication method: {0}")]
    UnsupportedAuthentication(String),
    #[error("upstream closed the connection during startup")]
    UpstreamClosed,
    #[error("session is not connected")]
    NotConnected,
    #[error("session closed")]
    Closed,
    #[error("server is shutting down")]
    Cancelled,
}
