//! Health check endpoints.

use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use serde::Serialize;

use muster_common::FormationState;
use muster_common::constants::AGENT_API_PREFIX;

use crate::state::AppState;

#[derive(Serialize)]
pub struct IndexResponse {
    #[serde(rename = "agentApi")]
    agent_api: &'static str,
}

/// Where the agent API is republished
pub async fn index() -> Json<IndexResponse> {
    Json(IndexResponse {
        agent_api: AGENT_API_PREFIX,
    })
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Basic health check (is the server running?)
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    node: String,
    formation: FormationState,
}

/// Readiness check: ready once the agent runs in join mode
pub async fn ready_check(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let formation = state.formation_state();

    let (code, status) = match formation {
        FormationState::Joining => (StatusCode::OK, "ready"),
        f if f.is_terminal() => (StatusCode::SERVICE_UNAVAILABLE, "failed"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "forming"),
    };

    (
        code,
        Json(ReadyResponse {
            status,
            node: state.node_name.clone(),
            formation,
        }),
    )
}
