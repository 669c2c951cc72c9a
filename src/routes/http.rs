// GET handlers: version, history, agents

use axum::{
    Json,
    extract::{Query, State},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState};
use crate::distribution::AgentSummary;
use crate::models::MetricRecord;
use crate::version::{NAME, VERSION};

/// GET /version: returns service name and version (from Cargo.toml at build time).
pub(super) async fn version_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": NAME,
        "version": VERSION,
    }))
}

#[derive(Debug, Deserialize)]
pub(super) struct MetricsQuery {
    agent_id: Option<String>,
    /// Kept as text: an unparsable limit falls back to the default instead of a 400.
    limit: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    agent_id: String,
    records: Vec<MetricRecord>,
}

#[derive(Serialize)]
struct SummaryResponse {
    agents: Vec<AgentSummary>,
}

#[derive(Serialize)]
struct AgentsResponse {
    agents: Vec<String>,
}

/// GET /api/metrics: history for `agent_id` (capped by `limit`), or every agent's
/// latest record when no agent is given.
pub(super) async fn metrics_handler(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Result<Response, ApiError> {
    let limit = query
        .limit
        .as_deref()
        .and_then(|l| l.trim().parse::<i64>().ok());

    match query.agent_id.filter(|id| !id.is_empty()) {
        Some(agent_id) => {
            let records = state
                .distribution
                .history(&agent_id, limit)
                .await
                .map_err(ApiError::internal)?;
            Ok(Json(HistoryResponse { agent_id, records }).into_response())
        }
        None => {
            let agents = state
                .distribution
                .summaries()
                .await
                .map_err(ApiError::internal)?;
            Ok(Json(SummaryResponse { agents }).into_response())
        }
    }
}

/// GET /api/agents: distinct agent ids, sorted.
pub(super) async fn agents_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let agents = state
        .distribution
        .agents()
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(AgentsResponse { agents }).into_response())
}
