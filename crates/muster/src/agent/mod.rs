//! Managed agent process lifecycle.
//!
//! Implements:
//! - Launching the agent in bootstrap or join mode
//! - Continuous stdout/stderr forwarding into tracing
//! - Graceful leave via the agent's own RPC command

mod output;
mod supervisor;

pub use supervisor::ProcessSupervisor;

use async_trait::async_trait;
use muster_common::{ClusterConfig, ClusterError, LaunchMode};

/// Owns the lifecycle of the managed agent.
///
/// There is no automatic respawn here; restart policy belongs to the caller.
#[async_trait]
pub trait Supervisor: Send + Sync {
    type Process: Send;

    /// Start the agent. Failure to start is fatal (`LaunchFailure`).
    async fn launch(&self, config: &ClusterConfig, mode: &LaunchMode) -> Result<Self::Process, ClusterError>;

    /// Ask the agent to leave its cluster. No-op if it already exited.
    async fn shutdown(&self, process: &mut Self::Process) -> Result<(), ClusterError>;

    /// Block until the agent has terminated
    async fn wait_for_exit(&self, process: &mut Self::Process) -> Result<(), ClusterError>;

    /// Non-blocking liveness check
    fn has_exited(&self, process: &mut Self::Process) -> bool;
}
