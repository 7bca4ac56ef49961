//! Service descriptor and its cached snapshot.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// An exposed database service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    /// Address the gateway listens on.
    #[serde(default = "default_listen_address")]
    pub listen_address: IpAddr,
    /// Real port the gateway listens on.
    pub port: u16,
    /// Whether clients must negotiate TLS.
    #[serde(default)]
    pub tls: bool,
    /// Upstream `host:port` addresses.
    pub upstreams: Vec<String>,
    #[serde(default)]
    pub postgres: PostgresUpstream,
}

/// How the gateway authenticates to the upstream server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgresUpstream {
    /// Upstream user. Falls back to the client's startup user.
    pub user: Option<String>,
    /// Upstream database. Falls back to the client's startup database.
    pub database: Option<String>,
    /// Secret holding the upstream password.
    pub password_secret: Option<String>,
}

fn default_listen_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

impl Service {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.port)
    }
}

/// Read-mostly cache holding the current service snapshot.
///
/// Readers get a cheap `Arc` clone; a refresh replaces the whole snapshot.
#[derive(Debug, Default)]
pub struct ServiceCache {
    current: RwLock<Option<Arc<Service>>>,
}

impl ServiceCache {
    pub fn new(service: Service) -> Self {
        Self {
            current: RwLock::new(Some(Arc::new(service))),
        }
    }

    pub fn get(&self) -> Option<Arc<Service>> {
        self.current.read().clone()
    }

    pub fn set(&self, service: Service) {
        *self.current.write() = Some(Arc::new(service));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(port: u16) -> Service {
        Service {
            name: "orders".to_string(),
            listen_address: default_listen_address(),
            port,
            tls: false,
            upstreams: vec!["127.0.0.1:5432".to_string()],
            postgres: PostgresUpstream::default(),
        }
    }

    #[test]
    fn test_cache_replaces_snapshot() {
        let cache = ServiceCache::new(service(5433));
        let before = cache.get().unwrap();

        cache.set(service(6433));

        assert_eq!(before.port, 5433);
        assert_eq!(cache.get().unwrap().port, 6433);
    }

    #[test]
    fn test_empty_cache() {
        assert!(ServiceCache::default().get().is_none());
    }

    #[test]
    fn test_deserialize_defaults() {
        let svc: Service = serde_yaml::from_str(
            "name: orders\nport: 5433\nupstreams: [\"db:5432\"]\n",
        )
        .unwrap();
        assert!(!svc.tls);
        assert_eq!(svc.listen_addr(), "0.0.0.0:5433".parse().unwrap());
        assert_eq!(svc.postgres, PostgresUpstream::default());
    }
}
