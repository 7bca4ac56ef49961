//! Connection admission and session lifecycle supervision.
//!
//! This module owns the listening socket and everything that happens to a
//! connection before its session handler takes over, plus the shutdown
//! protocol that drains every live session.
//!
//! ## Architecture
//!
//! ```text
//! +--------+
//! | Server |  <- Accepts TCP connections, owns shutdown
//! +--------+
//!      |
//!      v
//! +---------------+     +--------------+
//! | AdmissionGate | --> | PolicyClient |  <- authenticate-then-authorize
//! +---------------+     +--------------+
//!      |
//!      v
//! +----------------+     +-------------------+
//! | SessionFactory | --> | CredentialManager |  <- TLS identity, read per handshake
//! +----------------+     +-------------------+
//!      |
//!      v
//! +----------+
//! | Registry |  <- Live sessions, closed in bulk on shutdown
//! +----------+
//! ```
//!
//! ## Terminology
//!
//! - **Server**: Lifecycle supervisor exposing `run`/`close`
//! - **AdmissionGate**: Policy check every connection passes before any protocol bytes flow
//! - **CredentialManager**: Holds the cluster certificate; rotations apply to new handshakes
//! - **Registry**: Tracks live sessions so shutdown can close them
//! - **Drain**: Closing every live session before declaring the server closed

pub mod admission;
pub mod listener;
pub mod registry;
pub mod tls;

pub use admission::{Admission, AdmissionGate};
pub use listener::{Server, ServerOptions};
pub use registry::{Registration, Registry, RegistryClosed};
pub use tls::{CertificateHolder, CertificateSource, CredentialManager, TlsError};

/// Well-known name of the secret holding the cluster certificate.
pub const DEFAULT_CLUSTER_CERTIFICATE_SECRET: &str = "cluster-certificate";
