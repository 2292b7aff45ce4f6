//! Peer Client: one membership query against one agent.
//!
//! Issues `GET /v1/status/peers` and parses the JSON array of member
//! identifiers. Never retries; callers own the retry policy.

use std::time::Duration;

use async_trait::async_trait;
use muster_common::constants::PEERS_ENDPOINT;
use muster_common::{ClusterError, MembershipList, PeerAddress};

/// A single membership query against one peer
#[async_trait]
pub trait PeerQuery: Send + Sync {
    /// Returns the peer's membership view, or `PeerUnreachable`
    async fn peers(&self, peer: &PeerAddress) -> Result<MembershipList, ClusterError>;
}

/// HTTP implementation of [`PeerQuery`] against the agent API
#[derive(Clone)]
pub struct HttpPeerClient {
    http: reqwest::Client,
}

impl HttpPeerClient {
    /// Create a client whose every call is bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self, ClusterError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| ClusterError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http })
    }
}

#[async_trait]
impl PeerQuery for HttpPeerClient {
    async fn peers(&self, peer: &PeerAddress) -> Result<MembershipList, ClusterError> {
        let url = peer.url(PEERS_ENDPOINT);
        tracing::debug!(url = %url, "GET");

        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "GET failed");
                return Err(ClusterError::unreachable(peer, e));
            }
        };

        let status = response.status();
        tracing::debug!(url = %url, status = %status, "GET completed");

        if !status.is_success() {
            return Err(ClusterError::unreachable(peer, format!("HTTP {}", status)));
        }

        response
            .json::<MembershipList>()
            .await
            .map_err(|e| ClusterError::unreachable(peer, format!("malformed membership body: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{agent_answering, agent_failing, spawn_agent};
    use axum::{Router, routing::get};

    fn client() -> HttpPeerClient {
        HttpPeerClient::new(Duration::from_millis(500)).unwrap()
    }

    #[tokio::test]
    async fn test_parses_membership() {
        let peer = agent_answering(&["10.0.0.4:8300", "10.0.0.5:8300"]).await;

        let members = client().peers(&peer).await.unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members.hosts(), vec!["10.0.0.4", "10.0.0.5"]);
    }

    #[tokio::test]
    async fn test_empty_membership_is_success() {
        let peer = agent_answering(&[]).await;

        let members = client().peers(&peer).await.unwrap();
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn test_server_error_is_unreachable() {
        let peer = agent_failing(axum::http::StatusCode::INTERNAL_SERVER_ERROR).await;

        let err = client().peers(&peer).await.unwrap_err();
        assert!(matches!(err, ClusterError::PeerUnreachable { .. }));
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_unreachable() {
        let router = Router::new().route(PEERS_ENDPOINT, get(|| async { "not json" }));
        let peer = spawn_agent(router).await;

        let err = client().peers(&peer).await.unwrap_err();
        assert!(matches!(err, ClusterError::PeerUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = client().peers(&PeerAddress::new("127.0.0.1", port)).await;
        assert!(matches!(result, Err(ClusterError::PeerUnreachable { .. })));
    }

    #[tokio::test]
    async fn test_slow_peer_times_out() {
        let router = Router::new().route(
            PEERS_ENDPOINT,
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "[]"
            }),
        );
        let peer = spawn_agent(router).await;

        let started = std::time::Instant::now();
        let result = client().peers(&peer).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
