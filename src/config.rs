//! Gateway configuration file.
//!
//! ```yaml
//! service:
//!   name: orders
//!   port: 6432
//!   tls: true
//!   upstreams: ["10.0.0.5:5432"]
//!   postgres:
//!     user: gateway
//!     passwordSecret: orders-password
//! policy:
//!   authenticatedNetworks: ["10.0.0.0/8"]
//! secretsDir: /var/run/secrets/warden
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::policy::StaticPolicyConfig;
use crate::server::DEFAULT_CLUSTER_CERTIFICATE_SECRET;
use crate::service::Service;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub service: Service,
    #[serde(default)]
    pub policy: StaticPolicyConfig,
    #[serde(default = "default_secrets_dir")]
    pub secrets_dir: PathBuf,
    #[serde(default = "default_cluster_certificate_secret")]
    pub cluster_certificate_secret: String,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_secrets_dir() -> PathBuf {
    PathBuf::from("/var/run/secrets/warden")
}

fn default_cluster_certificate_secret() -> String {
    DEFAULT_CLUSTER_CERTIFICATE_SECRET.to_string()
}

fn default_drain_timeout_secs() -> u64 {
    10
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}
