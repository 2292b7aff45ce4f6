//! Reverse proxy from `/api/*` to the local agent HTTP API.

use axum::{
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

use muster_common::constants::{AGENT_API_PREFIX, headers};

use crate::state::AppState;

/// Largest request body forwarded to the agent
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Hop-by-hop headers never forwarded in either direction
const HOP_BY_HOP: [HeaderName; 4] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::TE,
];

/// Forward any request under the API prefix to the agent
pub async fn forward(State(state): State<AppState>, request: Request) -> Response {
    let Some(base) = state.agent_api.as_deref() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "agent HTTP API is disabled").into_response();
    };

    let url = upstream_url(base, request.uri().path(), request.uri().query());
    let (parts, body) = request.into_parts();

    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!(error = %e, "Rejected proxied request body");
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let mut request_headers = parts.headers;
    request_headers.remove(header::HOST);
    strip_hop_by_hop(&mut request_headers);
    request_headers.insert(
        HeaderName::from_static(headers::X_FORWARDED_BY),
        HeaderValue::from_static("muster"),
    );

    tracing::debug!(method = %parts.method, url = %url, "Proxying to agent");

    let upstream = match state
        .http
        .request(parts.method, &url)
        .headers(request_headers)
        .body(body)
        .send()
        .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Agent API request failed");
            return (StatusCode::BAD_GATEWAY, "agent API unreachable").into_response();
        }
    };

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Agent API response interrupted");
            return (StatusCode::BAD_GATEWAY, "agent API response interrupted").into_response();
        }
    };

    strip_hop_by_hop(&mut response_headers);
    response_headers.remove(header::CONTENT_LENGTH);
    if let Ok(node) = HeaderValue::from_str(&state.node_name) {
        response_headers.insert(HeaderName::from_static(headers::X_MUSTER_NODE), node);
    }

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    response.headers_mut().extend(response_headers);
    response
}

/// `/api/v1/kv/a?recurse` becomes `<base>/v1/kv/a?recurse`
fn upstream_url(base: &str, path: &str, query: Option<&str>) -> String {
    let rest = path.strip_prefix(AGENT_API_PREFIX).unwrap_or(path);
    let rest = if rest.is_empty() { "/" } else { rest };

    match query {
        Some(query) => format!("{}{}?{}", base, rest, query),
        None => format!("{}{}", base, rest),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
}
