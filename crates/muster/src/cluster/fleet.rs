//! Fleet directory: who am I, and who else is out there.

use muster_common::{ClusterConfig, PeerAddress};

/// Read-only lookup of the local node's layout and its fleet peers.
///
/// `peers` may change between calls; callers re-read it for every probe.
pub trait FleetDirectory: Send + Sync {
    /// The local node's agent configuration
    fn local(&self) -> ClusterConfig;

    /// Discovery endpoints of every other instance
    fn peers(&self) -> Vec<PeerAddress>;

    /// Instance count including the local node
    fn fleet_size(&self) -> usize {
        self.peers().len() + 1
    }
}

/// Fleet listed up front in configuration
#[derive(Debug, Clone)]
pub struct StaticFleet {
    local: ClusterConfig,
    peers: Vec<PeerAddress>,
}

impl StaticFleet {
    /// Entries pointing at the local node's own HTTP API are dropped, so the
    /// same peer list can be shipped to every instance.
    pub fn new(local: ClusterConfig, peers: Vec<PeerAddress>) -> Self {
        let local_hosts = [local.bind_addr().to_string(), local.client_addr().to_string()];
        let http = local.ports().http;

        let mut unique: Vec<PeerAddress> = Vec::with_capacity(peers.len());
        for peer in peers {
            let is_self = local_hosts.contains(&peer.host) && Some(peer.port) == http;
            if is_self {
                tracing::debug!(peer = %peer, "Dropping local node from fleet peers");
                continue;
            }
            if !unique.contains(&peer) {
                unique.push(peer);
            }
        }

        Self {
            local,
            peers: unique,
        }
    }
}

impl FleetDirectory for StaticFleet {
    fn local(&self) -> ClusterConfig {
        self.local.clone()
    }

    fn peers(&self) -> Vec<PeerAddress> {
        self.peers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_common::AgentPorts;

    #[test]
    fn test_static_fleet_drops_self_and_duplicates() {
        let local = ClusterConfig::new("node-a", "10.0.0.4", "10.0.0.4", AgentPorts::default(), "/data").unwrap();
        let peers = vec![
            PeerAddress::new("10.0.0.4", 8500),
            PeerAddress::new("10.0.0.5", 8500),
            PeerAddress::new("10.0.0.5", 8500),
            PeerAddress::new("10.0.0.6", 8500),
        ];

        let fleet = StaticFleet::new(local, peers);
        assert_eq!(
            fleet.peers(),
            vec![PeerAddress::new("10.0.0.5", 8500), PeerAddress::new("10.0.0.6", 8500)]
        );
        assert_eq!(fleet.fleet_size(), 3);
    }

    #[test]
    fn test_solo_fleet() {
        let local = ClusterConfig::new("node-a", "10.0.0.4", "10.0.0.4", AgentPorts::default(), "/data").unwrap();
        let fleet = StaticFleet::new(local, Vec::new());
        assert!(fleet.peers().is_empty());
        assert_eq!(fleet.fleet_size(), 1);
    }
}
