//! Policy decision point client.
//!
//! Every inbound connection is described by a [`DownstreamRequest`] and sent to
//! a [`PolicyClient`] before any protocol traffic flows. The response says
//! whether the caller was authenticated, whether it is authorized, and why.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use ipnet::IpNet;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

/// Connection source metadata sent to the policy decision point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownstreamRequest {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

/// Identity and attributes established by the policy decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestContext {
    pub principal: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

/// Why the decision came out the way it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionReason {
    pub rule: Option<String>,
    pub message: String,
}

/// Result of an authenticate-and-authorize call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub is_authenticated: bool,
    pub is_authorized: bool,
    pub request_context: RequestContext,
    pub reason: Option<DecisionReason>,
}

/// Policy client errors. Any error is treated as an authentication failure.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy decision point unavailable: {0}")]
    Unavailable(String),
}

/// Trait for the external policy decision point.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyClient: Send + Sync {
    async fn authenticate_and_authorize(
        &self,
        request: DownstreamRequest,
    ) -> Result<AuthResponse, PolicyError>;
}

/// Network rules for [`StaticPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticPolicyConfig {
    /// Sources in these networks are authenticated.
    #[serde(default = "default_authenticated_networks")]
    pub authenticated_networks: Vec<IpNet>,
    /// Authenticated sources in these networks are denied.
    #[serde(default)]
    pub denied_networks: Vec<IpNet>,
}

impl Default for StaticPolicyConfig {
    fn default() -> Self {
        Self {
            authenticated_networks: default_authenticated_networks(),
            denied_networks: Vec::new(),
        }
    }
}

fn default_authenticated_networks() -> Vec<IpNet> {
    ["127.0.0.0/8", "::1/128"]
        .iter()
        .filter_map(|net| net.parse().ok())
        .collect()
}

/// Policy client deciding from source-network rules alone.
#[derive(Debug, Clone)]
pub struct StaticPolicy {
    config: StaticPolicyConfig,
}

impl StaticPolicy {
    pub fn new(config: StaticPolicyConfig) -> Self {
        Self { config }
    }

    fn decide(&self, request: &DownstreamRequest) -> AuthResponse {
        let ip = request.source.ip();

        let Some(network) = self
            .config
            .authenticated_networks
            .iter()
            .find(|net| net.contains(&ip))
        else {
            return AuthResponse {
                is_authenticated: false,
                is_authorized: false,
                request_context: RequestContext::default(),
                reason: None,
            };
        };

        let mut request_context = RequestContext {
            principal: Some(format!("network:{network}")),
            attributes: BTreeMap::new(),
        };
        request_context
            .attributes
            .insert("source".to_string(), request.source.to_string());

        match self.config.denied_networks.iter().find(|net| net.contains(&ip)) {
            Some(denied) => AuthResponse {
                is_authenticated: true,
                is_authorized: false,
                request_context,
                reason: Some(DecisionReason {
                    rule: Some(denied.to_string()),
                    message: format!("source {ip} is in denied network {denied}"),
                }),
            },
            None => AuthResponse {
                is_authenticated: true,
                is_authorized: true,
                request_context,
                reason: Some(DecisionReason {
                    rule: Some(network.to_string()),
                    message: format!("source {ip} is in network {network}"),
                }),
            },
        }
    }
}

#[async_trait]
impl PolicyClient for StaticPolicy {
    async fn authenticate_and_authorize(
        &self,
        request: DownstreamRequest,
    ) -> Result<AuthResponse, PolicyError> {
        Ok(self.decide(&request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(source: &str) -> DownstreamRequest {
        DownstreamRequest {
            source: source.parse().unwrap(),
            destination: "10.0.0.1:5433".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_default_policy_trusts_loopback() {
        let policy = StaticPolicy::new(StaticPolicyConfig::default());

        let resp = policy
            .authenticate_and_authorize(request("127.0.0.1:40000"))
            .await
            .unwrap();
        assert!(resp.is_authenticated);
        assert!(resp.is_authorized);
        assert_eq!(
            resp.request_context.principal.as_deref(),
            Some("network:127.0.0.0/8")
        );

        let resp = policy
            .authenticate_and_authorize(request("[::1]:40000"))
            .await
            .unwrap();
        assert!(resp.is_authorized);
    }

    #[tokio::test]
    async fn test_unknown_network_is_unauthenticated() {
        let policy = StaticPolicy::new(StaticPolicyConfig::default());
        let resp = policy
            .authenticate_and_authorize(request("192.0.2.10:40000"))
            .await
            .unwrap();
        assert!(!resp.is_authenticated);
        assert!(!resp.is_authorized);
        assert!(resp.reason.is_none());
    }

    #[tokio::test]
    async fn test_denied_network() {
        let policy = StaticPolicy::new(StaticPolicyConfig {
            authenticated_networks: vec!["10.0.0.0/8".parse().unwrap()],
            denied_networks: vec!["10.1.0.0/16".parse().unwrap()],
        });

        let resp = policy
            .authenticate_and_authorize(request("10.1.2.3:40000"))
            .await
            .unwrap();
        assert!(resp.is_authenticated);
        assert!(!resp.is_authorized);
        assert_eq!(resp.reason.unwrap().rule.as_deref(), Some("10.1.0.0/16"));

        let resp = policy
            .authenticate_and_authorize(request("10.2.2.3:40000"))
            .await
            .unwrap();
        assert!(resp.is_authorized);
    }
}
