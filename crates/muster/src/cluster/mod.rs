//! Cluster formation modules.
//!
//! Implements:
//! - Peer membership queries over the agent HTTP API
//! - Concurrent discovery across the fleet
//! - Exclusive bootstrap lease (Redis or in-process)
//! - The bootstrap coordinator state machine

mod coordinator;
mod discovery;
mod fleet;
mod lease;
mod peer_client;
mod redis_lease;

pub use coordinator::{Coordinator, FormationSettings, JoinVia};
pub use discovery::DiscoveryProber;
pub use fleet::{FleetDirectory, StaticFleet};
pub use lease::{AcquireOutcome, CreateOutcome, LeaseHandle, LeaseLock, LeaseStore, MemoryLeaseStore};
pub use peer_client::{HttpPeerClient, PeerQuery};
pub use redis_lease::RedisLeaseStore;
