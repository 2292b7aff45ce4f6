//! Discovery Prober: is there already a cluster among the known fleet?
//!
//! Every known peer is queried concurrently and the first non-empty
//! membership view wins. Failed probes are dropped silently; an empty result
//! means no live peer reported a cluster.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use muster_common::{ClusterError, MembershipList, PeerAddress};

use super::PeerQuery;

/// Races membership queries across the fleet
#[derive(Clone)]
pub struct DiscoveryProber {
    client: Arc<dyn PeerQuery>,
    probe_timeout: Duration,
}

impl DiscoveryProber {
    pub fn new(client: Arc<dyn PeerQuery>, probe_timeout: Duration) -> Self {
        Self {
            client,
            probe_timeout,
        }
    }

    /// Returns the first non-empty membership any peer reports, or an empty
    /// list once every probe has failed or answered empty.
    ///
    /// Outstanding probes are dropped as soon as a winner is found.
    pub async fn discover(&self, peers: &[PeerAddress]) -> MembershipList {
        if peers.is_empty() {
            tracing::debug!("No known peers to probe");
            return MembershipList::empty();
        }

        let mut probes: FuturesUnordered<_> = peers.iter().map(|peer| self.probe(peer)).collect();

        while let Some((peer, result)) = probes.next().await {
            match result {
                // Not simply the first success: an agent that is up but not yet
                // in a cluster answers empty, and must not mask a formed one.
                Ok(members) if !members.is_empty() => {
                    tracing::info!(
                        peer = %peer,
                        members = members.len(),
                        "Peer reports an existing cluster"
                    );
                    return members;
                }
                Ok(_) => {
                    tracing::debug!(peer = %peer, "Peer is up but reports no cluster");
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "Probe failed");
                }
            }
        }

        MembershipList::empty()
    }

    async fn probe<'a>(
        &self,
        peer: &'a PeerAddress,
    ) -> (&'a PeerAddress, Result<MembershipList, ClusterError>) {
        let result = match tokio::time::timeout(self.probe_timeout, self.client.peers(peer)).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::unreachable(peer, "probe timed out")),
        };
        (peer, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::HttpPeerClient;
    use crate::testing::{ScriptedPeers, agent_answering, agent_failing};
    use axum::http::StatusCode;

    fn prober(client: Arc<dyn PeerQuery>) -> DiscoveryProber {
        DiscoveryProber::new(client, Duration::from_millis(300))
    }

    #[tokio::test]
    async fn test_empty_peer_set_finds_nothing() {
        let prober = prober(Arc::new(ScriptedPeers::default()));
        assert!(prober.discover(&[]).await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_peer_does_not_mask_healthy_peer() {
        let failing = agent_failing(StatusCode::INTERNAL_SERVER_ERROR).await;
        let healthy = agent_answering(&["10.0.0.4:8300", "10.0.0.5:8300"]).await;
        let client = Arc::new(HttpPeerClient::new(Duration::from_millis(500)).unwrap());

        let members = prober(client).discover(&[failing, healthy]).await;
        assert_eq!(members.len(), 2);
    }

    #[tokio::test]
    async fn test_all_failures_yield_empty() {
        let peers = ScriptedPeers::default()
            .failing("10.0.0.2")
            .failing("10.0.0.3");
        let fleet = peers.addresses();

        let members = prober(Arc::new(peers)).discover(&fleet).await;
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn test_fastest_answer_wins() {
        let peers = ScriptedPeers::default()
            .answering("10.0.0.2", &["10.0.0.2:8300"], Duration::from_millis(150))
            .answering("10.0.0.3", &["10.0.0.3:8300", "10.0.0.4:8300"], Duration::ZERO);
        let fleet = peers.addresses();

        let members = prober(Arc::new(peers)).discover(&fleet).await;
        assert_eq!(members.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_answer_waits_for_a_cluster() {
        let peers = ScriptedPeers::default()
            .answering("10.0.0.2", &[], Duration::ZERO)
            .answering("10.0.0.3", &["10.0.0.3:8300"], Duration::from_millis(50));
        let fleet = peers.addresses();

        let members = prober(Arc::new(peers)).discover(&fleet).await;
        assert_eq!(members.hosts(), vec!["10.0.0.3"]);
    }

    #[tokio::test]
    async fn test_hanging_peer_is_bounded() {
        let peers = ScriptedPeers::default()
            .answering("10.0.0.2", &["10.0.0.2:8300"], Duration::from_secs(30))
            .failing("10.0.0.3");
        let fleet = peers.addresses();

        let started = std::time::Instant::now();
        let members = prober(Arc::new(peers)).discover(&fleet).await;
        assert!(members.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
