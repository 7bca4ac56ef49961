//! PostgreSQL wire protocol subset used by the gateway.
//!
//! The gateway only speaks enough of the PostgreSQL v3.0 protocol to run the
//! startup phase on both legs of a session. Once both legs are established
//! the traffic is relayed byte-for-byte and never decoded.
//!
//! ## Architecture
//!
//! ```text
//! +----------+                         +---------+                         +----------+
//! |  Client  | -- StartupMessage -->   | warden  | -- StartupMessage -->   | Upstream |
//! |  (psql)  | <-- AuthenticationOk -- |         | <-- Authentication* --  | (server) |
//! +----------+                         +---------+                         +----------+
//!            ^                    ^                ^                  ^
//!            |    StartupCodec    |                |   BackendCodec   |
//!            +--------------------+                +------------------+
//! ```
//!
//! ## Terminology
//!
//! - **StartupMessage**: Messages a client sends before authentication (SSL, GSSENC, Cancel, Startup)
//! - **BackendMessage**: Messages the gateway writes to the client (AuthenticationOk, ErrorResponse)
//! - **UpstreamMessage**: Backend messages read from the upstream during its authentication exchange
//! - **Codec**: Framing for the two startup-phase directions

pub mod backend;
pub mod codec;
pub mod error;
pub mod frontend;

pub use backend::{
    Authentication, BackendMessage, ErrorField, ErrorFieldCode, UpstreamMessage, sql_state,
};
pub use codec::{BackendCodec, StartupCodec};
pub use error::ProtocolError;
pub use frontend::{StartupMessage, StartupParameters, write_password_message};
