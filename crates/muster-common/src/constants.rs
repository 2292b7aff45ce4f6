//! Shared constants for Muster components.

/// Default front door HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Default Redis connection URL (bootstrap lock store)
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default managed agent binary (resolved through PATH)
pub const DEFAULT_AGENT_BINARY: &str = "consul";

/// File name of the generated agent configuration
pub const AGENT_CONFIG_FILE: &str = "agent-config.json";

/// Membership endpoint exposed by every agent's HTTP API
pub const PEERS_ENDPOINT: &str = "/v1/status/peers";

/// Path prefix under which the front door republishes the agent API
pub const AGENT_API_PREFIX: &str = "/api";

/// Default agent ports
pub mod ports {
    pub const DNS: u16 = 8600;
    pub const HTTP: u16 = 8500;
    pub const RPC: u16 = 8400;
    pub const SERF_LAN: u16 = 8301;
    pub const SERF_WAN: u16 = 8302;
    pub const SERVER: u16 = 8300;
}

/// Bootstrap lock defaults
pub mod lock {
    /// Logical container holding the lock resource
    pub const DEFAULT_CONTAINER: &str = "muster";

    /// Lock resource name
    pub const DEFAULT_RESOURCE: &str = "bootstrap.lock";

    /// Bound on a single lock store call
    pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 5_000;

    /// Contents written when the resource is first created
    pub const RESOURCE_MARKER: &str = "Bootstrap lock. Only used for leasing.";

    /// Bootstrapper lease duration (1 minute)
    pub const DEFAULT_LEASE_SECS: u64 = 60;
}

/// Formation timing defaults
pub mod formation {
    /// Per-peer probe timeout
    pub const PROBE_TIMEOUT_MS: u64 = 3_000;

    /// Interval between local membership polls while waiting for quorum
    pub const QUORUM_POLL_MS: u64 = 1_000;

    /// Pause between lease attempts while another instance holds the lease
    pub const CONTENTION_RETRY_MS: u64 = 1_000;

    /// Ceiling for one bootstrap attempt (contention + quorum wait)
    pub const BOOTSTRAP_TIMEOUT_SECS: u64 = 600;

    /// How long a freshly spawned agent must stay alive to count as launched
    pub const LAUNCH_GRACE_MS: u64 = 500;

    /// Bound on the agent's `leave` command and on its exit afterwards
    pub const LEAVE_TIMEOUT_SECS: u64 = 30;
}

/// HTTP header names
pub mod headers {
    /// Added to every request forwarded to the local agent
    pub const X_FORWARDED_BY: &str = "x-forwarded-by";

    /// Added to every proxied response, carries the node name
    pub const X_MUSTER_NODE: &str = "x-muster-node";
}
