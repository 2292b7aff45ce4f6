//! Common error types for Muster components.

use thiserror::Error;

/// Errors raised while forming or joining a cluster
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A single peer probe failed (transport, non-2xx, or malformed body)
    #[error("Peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    /// The managed agent could not be started
    #[error("Agent launch failed: {0}")]
    LaunchFailure(String),

    /// Contention or quorum wait ran past the configured ceiling
    #[error("Bootstrap timed out: {0}")]
    BootstrapTimeout(String),

    /// The lock store rejected an operation outright (missing resource, bad script)
    #[error("Lock store error: {0}")]
    LockStore(String),

    /// The lock store could not be reached or did not answer in time
    #[error("Lock store unavailable: {0}")]
    LockUnavailable(String),

    /// Releasing a lease failed (logged by callers, never propagated)
    #[error("Lease release failed: {0}")]
    LeaseRelease(String),

    /// Invalid node or fleet configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local I/O error (config file, process control)
    #[error("I/O error: {0}")]
    Io(String),
}

impl ClusterError {
    /// Shorthand for a failed probe against `peer`
    pub fn unreachable(peer: impl ToString, reason: impl ToString) -> Self {
        Self::PeerUnreachable {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if forward progress is impossible after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LaunchFailure(_) | Self::BootstrapTimeout(_) | Self::LockStore(_) | Self::Config(_)
        )
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
