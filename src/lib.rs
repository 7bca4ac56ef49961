pub mod access_log;
pub mod balancer;
pub mod config;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod protocol;
pub mod secret;
pub mod server;
pub mod service;
pub mod session;

pub use error::{Error, Result};
