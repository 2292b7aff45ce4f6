//! HTTP front door for Muster.

use axum::{
    Router,
    routing::{any, get},
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::state::AppState;

mod health;
mod proxy;

/// Upper bound for any front door request, proxied ones included
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/", get(health::index))
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))

        // Agent HTTP API passthrough
        .route("/api", any(proxy::forward))
        .route("/api/{*path}", any(proxy::forward))

        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        )
        .with_state(state)
}
