//! Read-only HTTP API over the relay

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::announcement::HostPublicKey;
use crate::index::HostMatch;
use crate::relay::Relay;

/// Body returned with `410 Gone` when a prefix matches several hosts
pub const AMBIGUOUS_BODY: &str = "ambiguous pubkey";

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub relay: Arc<Relay>,
}

/// Create the REST API router
pub fn create_router(relay: Arc<Relay>) -> Router {
    let state = ApiState { relay };

    Router::new()
        .route("/synced", get(synced))
        .route("/height", get(height))
        .route("/host/:prefix", get(host))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn synced(State(state): State<ApiState>) -> impl IntoResponse {
    state.relay.synced().to_string()
}

async fn height(State(state): State<ApiState>) -> impl IntoResponse {
    state.relay.height().to_string()
}

/// Latest announcement of the host matching `prefix`, as raw bytes
async fn host(
    State(state): State<ApiState>,
    Path(prefix): Path<String>,
) -> Result<Response, ApiError> {
    let key = match state.relay.lookup(&prefix) {
        HostMatch::Unique(key) => key,
        HostMatch::Ambiguous(first) => return Err(ApiError::Ambiguous(first)),
        HostMatch::NotFound => return Err(ApiError::NoRecord),
    };

    // a revert may have removed the host since the lookup
    let announcement = state
        .relay
        .host_announcement(key.as_str())
        .ok_or(ApiError::NoRecord)?;

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        announcement,
    )
        .into_response())
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.relay.render_metrics(),
    )
}

#[derive(Debug)]
enum ApiError {
    NoRecord,
    Ambiguous(HostPublicKey),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NoRecord => StatusCode::NO_CONTENT.into_response(),
            ApiError::Ambiguous(first) => {
                debug!(%first, "Ambiguous host prefix");
                (StatusCode::GONE, AMBIGUOUS_BODY).into_response()
            }
        }
    }
}
