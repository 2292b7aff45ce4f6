//! Application state and shared resources.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::watch;

use muster_common::FormationState;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Agent node name, echoed on proxied responses
    pub node_name: String,

    /// Latest formation state published by the coordinator
    pub formation: watch::Receiver<FormationState>,

    /// Base URL of the local agent HTTP API (`None` when disabled)
    pub agent_api: Option<String>,

    /// Client used to proxy requests to the agent
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(
        node_name: impl Into<String>,
        formation: watch::Receiver<FormationState>,
        agent_api: Option<String>,
        proxy_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(proxy_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build proxy HTTP client")?;

        Ok(Self {
            node_name: node_name.into(),
            formation,
            agent_api,
            http,
        })
    }

    /// Current formation state
    pub fn formation_state(&self) -> FormationState {
        *self.formation.borrow()
    }
}
