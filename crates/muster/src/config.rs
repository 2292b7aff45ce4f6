//! Configuration management for Muster.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use muster_common::constants::{DEFAULT_AGENT_BINARY, DEFAULT_LISTEN_ADDR, DEFAULT_REDIS_URL, formation, lock, ports};
use muster_common::{AgentPorts, ClusterConfig, PeerAddress};

use crate::cluster::{FormationSettings, JoinVia};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Front door HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub fleet: FleetConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub formation: FormationConfig,
}

/// Identity and addresses of the local agent
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Agent node name (auto-generated if not set)
    #[serde(default = "generate_node_name")]
    pub name: String,

    #[serde(default = "default_addr")]
    pub bind_addr: String,

    #[serde(default = "default_addr")]
    pub client_addr: String,

    /// Agent data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub ports: PortsConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: generate_node_name(),
            bind_addr: default_addr(),
            client_addr: default_addr(),
            data_dir: default_data_dir(),
            ports: PortsConfig::default(),
        }
    }
}

/// Agent ports. A negative `dns` or `http` disables that listener.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_dns_port")]
    pub dns: i32,
    #[serde(default = "default_http_port")]
    pub http: i32,
    #[serde(default = "default_rpc_port")]
    pub rpc: u16,
    #[serde(default = "default_serf_lan_port")]
    pub serf_lan: u16,
    #[serde(default = "default_serf_wan_port")]
    pub serf_wan: u16,
    #[serde(default = "default_server_port")]
    pub server: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            dns: default_dns_port(),
            http: default_http_port(),
            rpc: default_rpc_port(),
            serf_lan: default_serf_lan_port(),
            serf_wan: default_serf_wan_port(),
            server: default_server_port(),
        }
    }
}

impl PortsConfig {
    pub fn to_agent_ports(self) -> Result<AgentPorts> {
        Ok(AgentPorts {
            dns: optional_port("dns", self.dns)?,
            http: optional_port("http", self.http)?,
            rpc: self.rpc,
            serf_lan: self.serf_lan,
            serf_wan: self.serf_wan,
            server: self.server,
        })
    }
}

fn optional_port(name: &str, value: i32) -> Result<Option<u16>> {
    if value < 0 {
        return Ok(None);
    }
    u16::try_from(value)
        .map(Some)
        .with_context(|| format!("port {} ({}) is out of range", name, value))
}

/// Managed agent process settings
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Agent executable, resolved through PATH
    #[serde(default = "default_agent_binary")]
    pub binary: String,

    /// Arguments placed before the agent sub-command, for wrappers such as
    /// a container runtime
    #[serde(default)]
    pub wrapper_args: Vec<String>,

    /// Where the generated agent config file is written
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// How long a fresh agent must stay up before launch counts as successful
    #[serde(default = "default_launch_grace")]
    pub launch_grace_ms: u64,

    /// Bound on the leave command and on the agent exiting after it
    #[serde(default = "default_leave_timeout")]
    pub leave_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            wrapper_args: Vec::new(),
            config_dir: default_config_dir(),
            launch_grace_ms: default_launch_grace(),
            leave_timeout_secs: default_leave_timeout(),
        }
    }
}

/// Other instances of this deployment
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FleetConfig {
    /// Discovery endpoints as `host:port`
    #[serde(default)]
    pub peers: Vec<String>,

    #[serde(default)]
    pub join_via: JoinVia,
}

/// Bootstrap lock store selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    #[default]
    Redis,
    /// In-process only, for single-instance development
    Memory,
}

/// Bootstrap lease settings
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    #[serde(default)]
    pub backend: LockBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_container")]
    pub container: String,

    #[serde(default = "default_resource")]
    pub resource: String,

    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Bound on a single lock store call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::default(),
            redis_url: default_redis_url(),
            container: default_container(),
            resource: default_resource(),
            lease_secs: default_lease_secs(),
            call_timeout_ms: default_call_timeout(),
        }
    }
}

/// Formation timings
#[derive(Debug, Clone, Deserialize)]
pub struct FormationConfig {
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_quorum_poll")]
    pub quorum_poll_ms: u64,

    #[serde(default = "default_contention_retry")]
    pub contention_retry_ms: u64,

    #[serde(default = "default_bootstrap_timeout")]
    pub bootstrap_timeout_secs: u64,
}

impl Default for FormationConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout(),
            quorum_poll_ms: default_quorum_poll(),
            contention_retry_ms: default_contention_retry(),
            bootstrap_timeout_secs: default_bootstrap_timeout(),
        }
    }
}

// Default value functions
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_addr() -> String { "127.0.0.1".to_string() }
fn default_data_dir() -> PathBuf { std::env::temp_dir().join("muster").join("data") }
fn default_config_dir() -> PathBuf { std::env::temp_dir().join("muster") }
fn default_agent_binary() -> String { DEFAULT_AGENT_BINARY.to_string() }
fn default_launch_grace() -> u64 { formation::LAUNCH_GRACE_MS }
fn default_leave_timeout() -> u64 { formation::LEAVE_TIMEOUT_SECS }
fn default_dns_port() -> i32 { i32::from(ports::DNS) }
fn default_http_port() -> i32 { i32::from(ports::HTTP) }
fn default_rpc_port() -> u16 { ports::RPC }
fn default_serf_lan_port() -> u16 { ports::SERF_LAN }
fn default_serf_wan_port() -> u16 { ports::SERF_WAN }
fn default_server_port() -> u16 { ports::SERVER }
fn default_redis_url() -> String { DEFAULT_REDIS_URL.to_string() }
fn default_container() -> String { lock::DEFAULT_CONTAINER.to_string() }
fn default_resource() -> String { lock::DEFAULT_RESOURCE.to_string() }
fn default_lease_secs() -> u64 { lock::DEFAULT_LEASE_SECS }
fn default_call_timeout() -> u64 { lock::DEFAULT_CALL_TIMEOUT_MS }
fn default_probe_timeout() -> u64 { formation::PROBE_TIMEOUT_MS }
fn default_quorum_poll() -> u64 { formation::QUORUM_POLL_MS }
fn default_contention_retry() -> u64 { formation::CONTENTION_RETRY_MS }
fn default_bootstrap_timeout() -> u64 { formation::BOOTSTRAP_TIMEOUT_SECS }

fn generate_node_name() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!("node-{:08x}", rng.random::<u32>())
}

impl AppConfig {
    /// Load configuration from file and `MUSTER__*` environment, with CLI overrides
    pub fn load(config_path: &str, args: &super::Args) -> Result<Self> {
        let mut builder = config::Config::builder();

        if Path::new(config_path).exists() {
            builder = builder.add_source(config::File::with_name(config_path));
        } else {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
        }

        let mut config: Self = builder
            .add_source(
                config::Environment::with_prefix("MUSTER")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("fleet.peers")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load config")?
            .try_deserialize()
            .context("Failed to parse config")?;

        // Apply CLI overrides
        if let Some(ref redis_url) = args.redis_url {
            config.lock.redis_url = redis_url.clone();
        }
        if let Some(ref listen) = args.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(ref name) = args.node_name {
            config.node.name = name.clone();
        }

        Ok(config)
    }

    /// Validated layout of the local agent
    pub fn cluster_config(&self) -> Result<ClusterConfig> {
        let ports = self.node.ports.to_agent_ports()?;
        ClusterConfig::new(
            self.node.name.clone(),
            &self.node.bind_addr,
            &self.node.client_addr,
            ports,
            self.node.data_dir.clone(),
        )
        .context("Invalid node configuration")
    }

    /// Parsed fleet discovery endpoints
    pub fn fleet_peers(&self) -> Result<Vec<PeerAddress>> {
        self.fleet
            .peers
            .iter()
            .map(|peer| peer.parse::<PeerAddress>().context("Invalid fleet peer"))
            .collect()
    }

    pub fn formation_settings(&self) -> FormationSettings {
        FormationSettings {
            quorum_poll: Duration::from_millis(self.formation.quorum_poll_ms),
            contention_retry: Duration::from_millis(self.formation.contention_retry_ms),
            bootstrap_timeout: Duration::from_secs(self.formation.bootstrap_timeout_secs),
            join_via: self.fleet.join_via,
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.formation.probe_timeout_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lock.lease_secs)
    }

    pub fn lock_call_timeout(&self) -> Duration {
        Duration::from_millis(self.lock.call_timeout_ms)
    }

    pub fn launch_grace(&self) -> Duration {
        Duration::from_millis(self.agent.launch_grace_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.leave_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            node: NodeConfig::default(),
            agent: AgentConfig::default(),
            fleet: FleetConfig::default(),
            lock: LockConfig::default(),
            formation: FormationConfig::default(),
        }
    }
}
