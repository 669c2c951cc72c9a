// HTTP routes: history queries (JSON), live feeds (SSE + WebSocket), version/health.

mod http;
mod sse;
mod ws;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::distribution::DistributionService;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) distribution: Arc<DistributionService>,
    /// Cancelled on server shutdown; live feeds run on child tokens.
    pub(crate) shutdown: CancellationToken,
}

pub fn app(distribution: Arc<DistributionService>, shutdown: CancellationToken) -> Router {
    let state = AppState {
        distribution,
        shutdown,
    };
    Router::new()
        .route("/healthz", get(|| async { "ok" })) // GET /healthz
        .route("/version", get(http::version_handler)) // GET /version
        .route("/api/metrics", get(http::metrics_handler)) // GET /api/metrics[?agent_id&limit]
        .route("/api/agents", get(http::agents_handler)) // GET /api/agents
        .route("/api/metrics/stream", get(sse::metrics_stream)) // SSE /api/metrics/stream?agent_id
        .route("/ws/metrics", get(ws::ws_metrics)) // WS /ws/metrics?agent_id
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}

/// `?agent_id=` for the live endpoints.
#[derive(Debug, Deserialize)]
pub(crate) struct FeedQuery {
    agent_id: Option<String>,
}

impl FeedQuery {
    fn required_agent_id(self) -> Result<String, ApiError> {
        self.agent_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "agent_id is required"))
    }
}

/// JSON error body `{"error": "..."}` with a status code.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub(crate) fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(status = self.status.as_u16(), error = %self.message, "http error");
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}
