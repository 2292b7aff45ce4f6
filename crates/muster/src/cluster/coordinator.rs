//! Bootstrap Coordinator: turns a fleet of undecided instances into one cluster.
//!
//! ```text
//! Discovering ──found──────────────────────────────────────────────► Joining
//!     │ empty                                                          ▲
//!     ▼                                                                │
//! LockContending ──held + found / acquired + found──────────────────────┤
//!     │ acquired, still empty                                          │
//!     ▼                                                                │
//! Bootstrapping ─► WaitingForQuorum ─quorum─► Restarting ──────────────┘
//! ```
//!
//! A losing contender always re-probes before retrying the lease, so it
//! joins the winner's cluster instead of waiting on a lease that is never
//! released to it. Lock store calls made while contending or waiting for
//! quorum are cut off at the bootstrap deadline.

use std::sync::Arc;
use std::time::Duration;

use muster_common::{ClusterConfig, ClusterError, FormationState, LaunchMode, MembershipList, QuorumTarget};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::Instant;

use super::{AcquireOutcome, DiscoveryProber, FleetDirectory, LeaseHandle, LeaseLock, PeerQuery};
use crate::agent::Supervisor;

/// Which addresses a joining agent is pointed at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinVia {
    /// Members reported by a live agent
    #[default]
    Members,
    /// Every fleet peer from the directory
    Fleet,
}

/// Timing and policy knobs for one formation attempt
#[derive(Debug, Clone)]
pub struct FormationSettings {
    pub quorum_poll: Duration,
    pub contention_retry: Duration,
    /// Ceiling for contention plus quorum wait
    pub bootstrap_timeout: Duration,
    pub join_via: JoinVia,
}

/// How the local agent ended up in its cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormationPath {
    /// First probe found a cluster
    JoinedExisting,
    /// A cluster appeared while contending for the lease
    FoundDuringContention,
    /// This instance bootstrapped the cluster and rejoined it
    Bootstrapped,
}

/// Result of a successful formation: the steady-state agent plus how we got there
pub struct Formation<P> {
    pub process: P,
    pub path: FormationPath,
    pub members: MembershipList,
    pub history: Vec<FormationState>,
}

enum Contention {
    Acquired(LeaseHandle),
    Found(MembershipList),
}

/// Runs the formation state machine once per process
pub struct Coordinator<V: Supervisor> {
    fleet: Arc<dyn FleetDirectory>,
    client: Arc<dyn PeerQuery>,
    prober: DiscoveryProber,
    lock: LeaseLock,
    supervisor: Arc<V>,
    settings: FormationSettings,
    state: watch::Sender<FormationState>,
    history: Vec<FormationState>,
}

impl<V: Supervisor> Coordinator<V> {
    pub fn new(
        fleet: Arc<dyn FleetDirectory>,
        client: Arc<dyn PeerQuery>,
        prober: DiscoveryProber,
        lock: LeaseLock,
        supervisor: Arc<V>,
        settings: FormationSettings,
        state: watch::Sender<FormationState>,
    ) -> Self {
        Self {
            fleet,
            client,
            prober,
            lock,
            supervisor,
            settings,
            state,
            history: Vec::new(),
        }
    }

    /// Form or join a cluster. Errors are fatal for the instance.
    pub async fn run(mut self) -> Result<Formation<V::Process>, ClusterError> {
        let config = self.fleet.local();

        match self.form(&config).await {
            Ok((process, path, members)) => Ok(Formation {
                process,
                path,
                members,
                history: self.history,
            }),
            Err(e) => {
                self.transition(FormationState::Failed);
                tracing::error!(node = %config.node_name(), error = %e, "Cluster formation failed");
                Err(e)
            }
        }
    }

    fn transition(&mut self, next: FormationState) {
        tracing::debug!(state = %next, "Formation state changed");
        self.history.push(next);
        self.state.send_replace(next);
    }

    async fn form(
        &mut self,
        config: &ClusterConfig,
    ) -> Result<(V::Process, FormationPath, MembershipList), ClusterError> {
        self.transition(FormationState::Discovering);
        tracing::info!(peers = self.fleet.peers().len(), "Searching for an existing cluster");

        let members = self.prober.discover(&self.fleet.peers()).await;
        if !members.is_empty() {
            tracing::info!(members = members.len(), "Found a cluster, joining it");
            return self.join(config, members, FormationPath::JoinedExisting).await;
        }

        tracing::info!("No cluster found, attempting to bootstrap one");
        self.transition(FormationState::LockContending);
        let deadline = Instant::now() + self.settings.bootstrap_timeout;

        let mut handle = match self.contend(deadline).await? {
            Contention::Found(members) => {
                return self.join(config, members, FormationPath::FoundDuringContention).await;
            }
            Contention::Acquired(handle) => handle,
        };

        // The lease is released whatever the bootstrap outcome
        let bootstrapped = self.bootstrap(config, &mut handle, deadline).await;
        self.lock.release(handle).await;
        let members = bootstrapped?;

        tracing::info!("Rejoining as a regular peer");
        let members = rejoin_members(config, members);
        self.join(config, members, FormationPath::Bootstrapped).await
    }

    fn contention_expired(&self) -> ClusterError {
        ClusterError::BootstrapTimeout(format!(
            "neither acquired '{}' nor found a cluster within {:?}",
            self.lock.resource(),
            self.settings.bootstrap_timeout
        ))
    }

    async fn contend(&mut self, deadline: Instant) -> Result<Contention, ClusterError> {
        let mut resource_ready = false;

        loop {
            if Instant::now() >= deadline {
                return Err(self.contention_expired());
            }

            let attempt = tokio::time::timeout_at(deadline, async {
                if !resource_ready {
                    self.lock.ensure_resource_exists().await?;
                    resource_ready = true;
                }
                self.lock.try_acquire().await
            })
            .await;

            let Ok(attempt) = attempt else {
                tracing::warn!("Lock store did not answer before the bootstrap deadline");
                return Err(self.contention_expired());
            };

            match attempt {
                Ok(AcquireOutcome::Acquired(handle)) => {
                    // A previous bootstrapper may have finished just before our lease
                    let members = self.prober.discover(&self.fleet.peers()).await;
                    if members.is_empty() {
                        return Ok(Contention::Acquired(handle));
                    }
                    tracing::info!(members = members.len(), "Cluster appeared while acquiring the lease");
                    self.lock.release(handle).await;
                    return Ok(Contention::Found(members));
                }
                Ok(AcquireOutcome::AlreadyHeld) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "Lease attempt failed, will retry");
                }
            }

            tracing::info!("Checking for clusters again");
            let members = self.prober.discover(&self.fleet.peers()).await;
            if !members.is_empty() {
                tracing::info!(members = members.len(), "Found a cluster while contending");
                return Ok(Contention::Found(members));
            }

            let wake = (Instant::now() + self.settings.contention_retry).min(deadline);
            tokio::time::sleep_until(wake).await;
        }
    }

    /// Launch solo, wait for quorum, then stop the solo agent.
    ///
    /// Returns the membership observed at quorum.
    async fn bootstrap(
        &mut self,
        config: &ClusterConfig,
        handle: &mut LeaseHandle,
        deadline: Instant,
    ) -> Result<MembershipList, ClusterError> {
        self.transition(FormationState::Bootstrapping);

        let local = config.local_peer().ok_or_else(|| {
            ClusterError::Config("the agent HTTP port is required to observe quorum".into())
        })?;
        let quorum = QuorumTarget::for_fleet(self.fleet.fleet_size());

        tracing::info!(quorum = %quorum, "Bootstrap lease acquired, launching agent in bootstrap mode");
        let mut process = self.supervisor.launch(config, &LaunchMode::BootstrapSolo).await?;

        self.transition(FormationState::WaitingForQuorum);
        tracing::info!(quorum = %quorum, "Waiting for quorum of nodes to join");

        let members = loop {
            if self.supervisor.has_exited(&mut process) {
                self.stop(&mut process).await;
                return Err(ClusterError::LaunchFailure(
                    "bootstrap agent exited while waiting for quorum".into(),
                ));
            }

            match self.client.peers(&local).await {
                Ok(members) if quorum.is_met(members.len()) => break members,
                Ok(members) => {
                    tracing::info!(joined = members.len(), quorum = %quorum, "No quorum yet");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Local agent not answering yet");
                }
            }

            if handle.needs_renewal()
                && tokio::time::timeout_at(deadline, self.lock.renew(handle)).await.is_err()
            {
                tracing::warn!("Lease renewal cut off by the bootstrap deadline");
            }

            if Instant::now() >= deadline {
                self.stop(&mut process).await;
                return Err(ClusterError::BootstrapTimeout(format!(
                    "quorum of {} not reached within {:?}",
                    quorum, self.settings.bootstrap_timeout
                )));
            }
            let wake = (Instant::now() + self.settings.quorum_poll).min(deadline);
            tokio::time::sleep_until(wake).await;
        };

        self.transition(FormationState::Restarting);
        tracing::info!(members = members.len(), "Quorum reached, leaving and rejoining");
        self.supervisor.shutdown(&mut process).await?;
        self.supervisor.wait_for_exit(&mut process).await?;

        Ok(members)
    }

    async fn join(
        &mut self,
        config: &ClusterConfig,
        members: MembershipList,
        path: FormationPath,
    ) -> Result<(V::Process, FormationPath, MembershipList), ClusterError> {
        self.transition(FormationState::Joining);

        let mode = match self.settings.join_via {
            JoinVia::Members => LaunchMode::JoinMembers(members.clone()),
            JoinVia::Fleet => LaunchMode::JoinPeers(self.fleet.peers()),
        };

        let process = self.supervisor.launch(config, &mode).await?;
        tracing::info!(path = ?path, mode = %mode, "Agent joined the cluster");
        Ok((process, path, members))
    }

    /// Best-effort stop on error paths
    async fn stop(&self, process: &mut V::Process) {
        if let Err(e) = self.supervisor.shutdown(process).await {
            tracing::warn!(error = %e, "Failed to shut down bootstrap agent");
        }
        if let Err(e) = self.supervisor.wait_for_exit(process).await {
            tracing::warn!(error = %e, "Failed to wait for bootstrap agent");
        }
    }
}

/// Members to rejoin after a bootstrap, excluding the local node.
///
/// A solo fleet has nobody else, so it rejoins itself.
fn rejoin_members(config: &ClusterConfig, members: MembershipList) -> MembershipList {
    let others = members
        .without_host(&config.bind_addr().to_string())
        .without_host(&config.client_addr().to_string());

    if others.is_empty() { members } else { others }
}
