//! Per-connection session handlers.
//!
//! The supervisor never touches protocol bytes itself. A [`SessionFactory`]
//! runs the downstream handshake for an admitted connection and produces a
//! [`SessionHandler`], which then owns both legs of the session.
//!
//! ## Lifecycle
//!
//! ```text
//! SessionFactory::handshake -> SessionHandler::connect -> SessionHandler::serve
//!                                        |                        |
//!                                        +---- SessionHandler::close (any time, idempotent)
//! ```

pub mod error;
pub mod handshake;
pub mod postgres;
pub mod stream;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::balancer::LoadBalancer;
use crate::policy::AuthResponse;
use crate::secret::SecretStore;
use crate::service::Service;

pub use error::SessionError;
pub use postgres::{PgSession, PgSessionFactory};
pub use stream::ClientStream;

/// One admitted client connection and its upstream counterpart.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    fn id(&self) -> &str;

    fn created_at(&self) -> DateTime<Utc>;

    /// Establishes the upstream leg.
    async fn connect(
        &self,
        cancel: &CancellationToken,
        balancer: &dyn LoadBalancer,
        service: &Service,
        secrets: &dyn SecretStore,
    ) -> Result<(), SessionError>;

    /// Relays traffic until either side closes, the session is closed, or
    /// `cancel` fires.
    async fn serve(&self, cancel: &CancellationToken) -> Result<(), SessionError>;

    /// Requests closure. Safe to call repeatedly and from any task.
    fn close(&self);
}

/// Builds session handlers for admitted connections.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Negotiates the downstream protocol handshake on `socket`.
    ///
    /// `tls` is a snapshot of the live TLS configuration, present when the
    /// service offers TLS.
    async fn handshake(
        &self,
        socket: TcpStream,
        tls: Option<TlsAcceptor>,
        service: &Service,
        auth: &AuthResponse,
    ) -> Result<Arc<dyn SessionHandler>, SessionError>;
}
