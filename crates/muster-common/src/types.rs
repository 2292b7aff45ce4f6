//! Core types shared across Muster components.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::ports;
use crate::error::ClusterError;

/// Named port set of the managed agent.
///
/// `dns` and `http` are optional client-facing listeners; the rest are
/// always bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPorts {
    pub dns: Option<u16>,
    pub http: Option<u16>,
    pub rpc: u16,
    pub serf_lan: u16,
    pub serf_wan: u16,
    pub server: u16,
}

impl Default for AgentPorts {
    fn default() -> Self {
        Self {
            dns: Some(ports::DNS),
            http: Some(ports::HTTP),
            rpc: ports::RPC,
            serf_lan: ports::SERF_LAN,
            serf_wan: ports::SERF_WAN,
            server: ports::SERVER,
        }
    }
}

impl AgentPorts {
    /// Every bound port with its name
    pub fn named(&self) -> Vec<(&'static str, u16)> {
        let mut named = vec![
            ("rpc", self.rpc),
            ("serf_lan", self.serf_lan),
            ("serf_wan", self.serf_wan),
            ("server", self.server),
        ];
        if let Some(dns) = self.dns {
            named.push(("dns", dns));
        }
        if let Some(http) = self.http {
            named.push(("http", http));
        }
        named
    }

    /// Fails if two listeners share a port
    pub fn validate(&self) -> Result<(), ClusterError> {
        let mut seen = HashSet::new();
        for (name, port) in self.named() {
            if port == 0 {
                return Err(ClusterError::Config(format!("port {} must be non-zero", name)));
            }
            if !seen.insert(port) {
                return Err(ClusterError::Config(format!(
                    "port {} ({}) collides with another agent port",
                    name, port
                )));
            }
        }
        Ok(())
    }
}

/// Identity and network layout of the local agent.
///
/// Built once per process; validated at construction so every holder can
/// rely on distinct ports and parsed addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    node_name: String,
    bind_addr: IpAddr,
    client_addr: IpAddr,
    ports: AgentPorts,
    data_dir: PathBuf,
}

impl ClusterConfig {
    pub fn new(
        node_name: impl Into<String>,
        bind_addr: &str,
        client_addr: &str,
        ports: AgentPorts,
        data_dir: impl Into<PathBuf>,
    ) -> Result<Self, ClusterError> {
        let node_name = node_name.into();
        if node_name.trim().is_empty() {
            return Err(ClusterError::Config("node name must not be empty".into()));
        }

        let bind_addr = parse_ip("bind_addr", bind_addr)?;
        let client_addr = parse_ip("client_addr", client_addr)?;
        ports.validate()?;

        Ok(Self {
            node_name,
            bind_addr,
            client_addr,
            ports,
            data_dir: data_dir.into(),
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn bind_addr(&self) -> IpAddr {
        self.bind_addr
    }

    pub fn client_addr(&self) -> IpAddr {
        self.client_addr
    }

    pub fn ports(&self) -> &AgentPorts {
        &self.ports
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Address the agent's `leave` command talks to
    pub fn rpc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.client_addr, self.ports.rpc)
    }

    /// The local agent's own HTTP API, if enabled
    pub fn local_peer(&self) -> Option<PeerAddress> {
        self.ports
            .http
            .map(|port| PeerAddress::new(self.client_addr.to_string(), port))
    }

    /// Base URL of the local agent's HTTP API, if enabled
    pub fn http_api_url(&self) -> Option<String> {
        self.local_peer().map(|peer| peer.base_url())
    }

    /// Join target for another fleet member reachable at `host`
    pub fn join_target(&self, host: &str) -> String {
        format_host_port(host, self.ports.serf_lan)
    }

    /// JSON document handed to the agent via `-config-file`.
    ///
    /// Disabled optional listeners are written as `-1`.
    pub fn to_agent_json(&self) -> serde_json::Value {
        serde_json::json!({
            "node_name": self.node_name,
            "bind_addr": self.bind_addr.to_string(),
            "client_addr": self.client_addr.to_string(),
            "ports": {
                "dns": self.ports.dns.map(i32::from).unwrap_or(-1),
                "http": self.ports.http.map(i32::from).unwrap_or(-1),
                "rpc": self.ports.rpc,
                "serf_lan": self.ports.serf_lan,
                "serf_wan": self.ports.serf_wan,
                "server": self.ports.server,
            },
            "data_dir": self.data_dir.to_string_lossy(),
        })
    }
}

fn parse_ip(field: &str, value: &str) -> Result<IpAddr, ClusterError> {
    value
        .trim()
        .parse()
        .map_err(|_| ClusterError::Config(format!("{} '{}' is not an IP address", field, value)))
}

fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Strips the port from a `host:port` member identifier
pub fn member_host(member: &str) -> &str {
    if let Some(rest) = member.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match member.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => member,
    }
}

/// Discovery endpoint of another fleet member
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `http://host:port`
    pub fn base_url(&self) -> String {
        format!("http://{}", self)
    }

    /// Full URL of `path` on this peer
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_host_port(&self.host, self.port))
    }
}

impl FromStr for PeerAddress {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = match s.strip_prefix('[') {
            Some(rest) => rest
                .split_once("]:")
                .ok_or_else(|| ClusterError::Config(format!("invalid peer address '{}'", s)))?,
            None => s
                .rsplit_once(':')
                .ok_or_else(|| ClusterError::Config(format!("peer address '{}' has no port", s)))?,
        };

        if host.is_empty() {
            return Err(ClusterError::Config(format!("peer address '{}' has no host", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ClusterError::Config(format!("invalid port in peer address '{}'", s)))?;

        Ok(Self::new(host, port))
    }
}

/// Member identifiers (typically `host:port`) reported by an agent.
///
/// An empty list is a successful answer, distinct from a failed query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MembershipList(Vec<String>);

impl MembershipList {
    pub fn new(members: Vec<String>) -> Self {
        Self(members)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    /// Member hosts with ports stripped, in reported order
    pub fn hosts(&self) -> Vec<String> {
        self.0.iter().map(|m| member_host(m).to_string()).collect()
    }

    /// Copy of this list without members living on `host`
    pub fn without_host(&self, host: &str) -> Self {
        Self(
            self.0
                .iter()
                .filter(|m| member_host(m) != host)
                .cloned()
                .collect(),
        )
    }
}

impl From<Vec<String>> for MembershipList {
    fn from(members: Vec<String>) -> Self {
        Self(members)
    }
}

/// Minimum membership count before a bootstrap is finalized.
///
/// Fixed for one bootstrap attempt once computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuorumTarget(usize);

impl QuorumTarget {
    /// `floor(fleet_size / 2) + 1`
    pub fn for_fleet(fleet_size: usize) -> Self {
        Self(fleet_size / 2 + 1)
    }

    pub fn value(&self) -> usize {
        self.0
    }

    pub fn is_met(&self, members: usize) -> bool {
        members >= self.0
    }
}

impl fmt::Display for QuorumTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the managed agent is started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMode {
    /// Form a brand new single-member cluster
    BootstrapSolo,
    /// Join through the fleet directory's discovery addresses
    JoinPeers(Vec<PeerAddress>),
    /// Join the members reported by a live agent
    JoinMembers(MembershipList),
}

impl LaunchMode {
    pub fn is_bootstrap(&self) -> bool {
        matches!(self, Self::BootstrapSolo)
    }

    /// Hosts to pass as join targets, deduplicated in order
    pub fn join_hosts(&self) -> Vec<String> {
        let hosts = match self {
            Self::BootstrapSolo => Vec::new(),
            Self::JoinPeers(peers) => peers.iter().map(|p| p.host.clone()).collect(),
            Self::JoinMembers(members) => members.hosts(),
        };

        let mut seen = HashSet::new();
        hosts.into_iter().filter(|h| seen.insert(h.clone())).collect()
    }
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BootstrapSolo => f.write_str("bootstrap-solo"),
            Self::JoinPeers(peers) => write!(f, "join-peers({})", peers.len()),
            Self::JoinMembers(members) => write!(f, "join-members({})", members.len()),
        }
    }
}

/// Cluster formation state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormationState {
    /// Probing the fleet for an existing cluster
    Discovering,
    /// Racing other instances for the bootstrap lease
    LockContending,
    /// Lease held, solo agent starting
    Bootstrapping,
    /// Polling the solo agent until quorum members joined
    WaitingForQuorum,
    /// Leaving the solo cluster before rejoining as a peer
    Restarting,
    /// Agent running in steady join mode (terminal)
    Joining,
    /// Formation failed (terminal)
    Failed,
}

impl FormationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Joining | Self::Failed)
    }
}

impl fmt::Display for FormationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Discovering => "discovering",
            Self::LockContending => "lock_contending",
            Self::Bootstrapping => "bootstrapping",
            Self::WaitingForQuorum => "waiting_for_quorum",
            Self::Restarting => "restarting",
            Self::Joining => "joining",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}
