//! Upstream selection.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::service::Service;

/// Default timeout for a single upstream connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error("service {0} has no upstreams")]
    NoUpstreams(String),
    #[error("failed to connect to upstream {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out connecting to upstream {0}")]
    Timeout(String),
}

/// Trait for choosing and dialing an upstream for a new session.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    async fn select_and_connect(&self, service: &Service) -> Result<TcpStream, BalancerError>;
}

/// Round-robin over the service's upstreams, failing over to the next
/// address when a connect attempt fails.
#[derive(Debug)]
pub struct RoundRobin {
    next: AtomicUsize,
    connect_timeout: Duration,
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl RoundRobin {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            next: AtomicUsize::new(0),
            connect_timeout,
        }
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream, BalancerError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| BalancerError::Timeout(addr.to_string()))?
            .map_err(|source| BalancerError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        stream
            .set_nodelay(true)
            .map_err(|source| BalancerError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        Ok(stream)
    }
}

#[async_trait]
impl LoadBalancer for RoundRobin {
    async fn select_and_connect(&self, service: &Service) -> Result<TcpStream, BalancerError> {
        let upstreams = &service.upstreams;
        if upstreams.is_empty() {
            return Err(BalancerError::NoUpstreams(service.name.clone()));
        }

        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let mut last_err = None;
        for i in 0..upstreams.len() {
            let addr = &upstreams[(start + i) % upstreams.len()];
            match self.connect(addr).await {
                Ok(stream) => {
                    debug!(service = %service.name, upstream = %addr, "Connected to upstream");
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(service = %service.name, upstream = %addr, error = %e, "Upstream connect failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| BalancerError::NoUpstreams(service.name.clone())))
    }
}
