//! # Muster Common
//!
//! Shared types, errors, and constants used across Muster components.
//!
//! ## Modules
//! - `types` - Cluster data model (ClusterConfig, PeerAddress, QuorumTarget, etc.)
//! - `error` - Cluster formation error taxonomy
//! - `constants` - Default ports, endpoints, and timings

pub mod constants;
pub mod error;
pub mod types;

pub use error::ClusterError;
pub use types::*;
