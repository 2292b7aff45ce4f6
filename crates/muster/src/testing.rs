//! Fakes shared by unit tests: HTTP agents, scripted peers and a simulated fleet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{Json, Router, http::StatusCode, routing::get};
use muster_common::constants::{PEERS_ENDPOINT, ports};
use muster_common::{AgentPorts, ClusterConfig, ClusterError, LaunchMode, MembershipList, PeerAddress};

use crate::agent::Supervisor;
use crate::cluster::{PeerQuery, StaticFleet};

/// Serve `router` on an ephemeral local port
pub async fn spawn_agent(router: Router) -> PeerAddress {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    PeerAddress::new("127.0.0.1", port)
}

/// Agent whose peers endpoint reports `members`
pub async fn agent_answering(members: &[&str]) -> PeerAddress {
    let members: Vec<String> = members.iter().map(|m| m.to_string()).collect();
    let router = Router::new().route(
        PEERS_ENDPOINT,
        get(move || {
            let members = members.clone();
            async move { Json(members) }
        }),
    );
    spawn_agent(router).await
}

/// Agent whose peers endpoint always answers `status`
pub async fn agent_failing(status: StatusCode) -> PeerAddress {
    let router = Router::new().route(PEERS_ENDPOINT, get(move || async move { status }));
    spawn_agent(router).await
}

enum Script {
    Answer(Vec<String>, Duration),
    Fail,
}

/// In-memory [`PeerQuery`] with a fixed answer per host
#[derive(Default)]
pub struct ScriptedPeers {
    scripts: Vec<(String, Script)>,
}

impl ScriptedPeers {
    pub fn answering(mut self, host: &str, members: &[&str], delay: Duration) -> Self {
        let members = members.iter().map(|m| m.to_string()).collect();
        self.scripts.push((host.to_string(), Script::Answer(members, delay)));
        self
    }

    pub fn failing(mut self, host: &str) -> Self {
        self.scripts.push((host.to_string(), Script::Fail));
        self
    }

    /// Discovery addresses of every scripted host, in script order
    pub fn addresses(&self) -> Vec<PeerAddress> {
        self.scripts
            .iter()
            .map(|(host, _)| PeerAddress::new(host.clone(), ports::HTTP))
            .collect()
    }
}

#[async_trait]
impl PeerQuery for ScriptedPeers {
    async fn peers(&self, peer: &PeerAddress) -> Result<MembershipList, ClusterError> {
        match self.scripts.iter().find(|(host, _)| *host == peer.host) {
            Some((_, Script::Answer(members, delay))) => {
                tokio::time::sleep(*delay).await;
                Ok(MembershipList::new(members.clone()))
            }
            Some((_, Script::Fail)) | None => Err(ClusterError::unreachable(peer, "connection refused")),
        }
    }
}

#[derive(Debug, Default)]
struct SimNode {
    running: bool,
    /// Last cluster this node belonged to; survives a leave like an agent data dir
    cluster: Option<usize>,
    fail_launch: bool,
}

#[derive(Debug, Default)]
struct World {
    hosts: Vec<String>,
    nodes: HashMap<String, SimNode>,
    next_cluster: usize,
    bootstrap_launches: usize,
}

impl World {
    fn new_cluster(&mut self) -> usize {
        self.next_cluster += 1;
        self.next_cluster
    }

    fn members(&self, cluster: usize) -> Vec<String> {
        self.hosts
            .iter()
            .filter(|host| {
                self.nodes
                    .get(*host)
                    .is_some_and(|n| n.running && n.cluster == Some(cluster))
            })
            .map(|host| format!("{}:{}", host, ports::SERVER))
            .collect()
    }

    fn running_cluster(&self, host: &str) -> Option<usize> {
        self.nodes.get(host).filter(|n| n.running).and_then(|n| n.cluster)
    }
}

/// A fleet of simulated agents sharing one world.
///
/// Acts as the peer query transport and the process supervisor for every
/// coordinator in a test, so several coordinators can race in one runtime.
#[derive(Clone)]
pub struct SimFleet {
    world: Arc<Mutex<World>>,
}

impl SimFleet {
    pub fn new(hosts: &[&str]) -> Self {
        let world = World {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            nodes: hosts.iter().map(|h| (h.to_string(), SimNode::default())).collect(),
            ..Default::default()
        };
        Self {
            world: Arc::new(Mutex::new(world)),
        }
    }

    /// Start `hosts` as an already formed cluster
    pub fn start_cluster(&self, hosts: &[&str]) {
        let mut world = self.world.lock().unwrap();
        let cluster = world.new_cluster();
        for host in hosts {
            let node = world.nodes.entry(host.to_string()).or_default();
            node.running = true;
            node.cluster = Some(cluster);
        }
    }

    pub fn fail_launches(&self, host: &str) {
        self.world.lock().unwrap().nodes.entry(host.to_string()).or_default().fail_launch = true;
    }

    /// Fleet directory as seen from `host`
    pub fn directory(&self, host: &str) -> StaticFleet {
        let local = ClusterConfig::new(format!("node-{}", host), host, host, AgentPorts::default(), "/data")
            .unwrap();
        let peers = self
            .world
            .lock()
            .unwrap()
            .hosts
            .iter()
            .map(|h| PeerAddress::new(h.clone(), ports::HTTP))
            .collect();
        StaticFleet::new(local, peers)
    }

    pub fn supervisor(&self) -> SimSupervisor {
        SimSupervisor { sim: self.clone() }
    }

    pub fn bootstrap_launches(&self) -> usize {
        self.world.lock().unwrap().bootstrap_launches
    }

    pub fn is_running(&self, host: &str) -> bool {
        self.world.lock().unwrap().nodes.get(host).is_some_and(|n| n.running)
    }

    /// Members of the cluster `host` is currently running in
    pub fn members_of(&self, host: &str) -> Vec<String> {
        let world = self.world.lock().unwrap();
        world
            .running_cluster(host)
            .map(|cluster| world.members(cluster))
            .unwrap_or_default()
    }
}

#[async_trait]
impl PeerQuery for SimFleet {
    async fn peers(&self, peer: &PeerAddress) -> Result<MembershipList, ClusterError> {
        let world = self.world.lock().unwrap();
        match world.nodes.get(&peer.host) {
            Some(node) if node.running => Ok(MembershipList::new(
                node.cluster.map(|c| world.members(c)).unwrap_or_default(),
            )),
            _ => Err(ClusterError::unreachable(peer, "connection refused")),
        }
    }
}

/// A simulated agent process
#[derive(Debug)]
pub struct SimProcess {
    pub host: String,
    pub mode: LaunchMode,
}

/// [`Supervisor`] that starts and stops agents in a [`SimFleet`]
pub struct SimSupervisor {
    sim: SimFleet,
}

#[async_trait]
impl Supervisor for SimSupervisor {
    type Process = SimProcess;

    async fn launch(&self, config: &ClusterConfig, mode: &LaunchMode) -> Result<SimProcess, ClusterError> {
        let host = config.bind_addr().to_string();
        let mut world = self.sim.world.lock().unwrap();

        if world.nodes.get(&host).is_some_and(|n| n.fail_launch) {
            return Err(ClusterError::LaunchFailure(format!("simulated launch failure on {}", host)));
        }

        let cluster = match mode {
            LaunchMode::BootstrapSolo => {
                world.bootstrap_launches += 1;
                Some(world.new_cluster())
            }
            _ => mode
                .join_hosts()
                .iter()
                .find_map(|h| world.running_cluster(h))
                .or_else(|| world.nodes.get(&host).and_then(|n| n.cluster)),
        };

        let node = world.nodes.entry(host.clone()).or_default();
        node.running = true;
        node.cluster = cluster;

        Ok(SimProcess {
            host,
            mode: mode.clone(),
        })
    }

    async fn shutdown(&self, process: &mut SimProcess) -> Result<(), ClusterError> {
        let mut world = self.sim.world.lock().unwrap();
        if let Some(node) = world.nodes.get_mut(&process.host) {
            node.running = false;
        }
        Ok(())
    }

    async fn wait_for_exit(&self, _process: &mut SimProcess) -> Result<(), ClusterError> {
        Ok(())
    }

    fn has_exited(&self, process: &mut SimProcess) -> bool {
        !self.sim.is_running(&process.host)
    }
}
