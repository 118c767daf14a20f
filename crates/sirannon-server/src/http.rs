//! `POST /db/{id}/{query,execute,transaction}` plus readiness/liveness.
//!
//! HTTP is the only transport that exposes `transaction`; the WebSocket
//! session in [`crate::ws`] never routes a `transaction` message to these
//! handlers.

use crate::error::{Error, Result};
use crate::registry::DatabaseRegistry;
use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value as JsonValue};
use sirannon_core::value::{normalize_params, row_to_json};
use sirannon_protocol::{
    to_execute_response, DatabaseStatus, ExecuteRequest, HealthResponse, QueryRequest,
    ReadyResponse, TransactionRequest,
};
use std::sync::Arc;

pub type AppState = Arc<DatabaseRegistry>;

#[tracing::instrument(skip(state, body), fields(database = %id))]
pub async fn query(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<QueryRequest>,
) -> Result<Json<JsonValue>> {
    let db = state.get(&id)?;
    let params = normalize_params(body.params);
    let rows = db.query(&body.sql, &params).await.map_err(Error::Core)?;
    let rows_json: Vec<JsonValue> = rows.iter().map(row_to_json).collect();
    Ok(Json(json!({ "rows": rows_json })))
}

#[tracing::instrument(skip(state, body), fields(database = %id))]
pub async fn execute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ExecuteRequest>,
) -> Result<Json<JsonValue>> {
    let db = state.get(&id)?;
    let params = normalize_params(body.params);
    let result = db.execute(&body.sql, &params).await.map_err(Error::Core)?;
    Ok(Json(to_execute_response(&result)))
}

#[tracing::instrument(skip(state, body), fields(database = %id))]
pub async fn transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TransactionRequest>,
) -> Result<Json<JsonValue>> {
    let db = state.get(&id)?;
    let statements: Vec<(String, Vec<_>)> = body
        .statements
        .into_iter()
        .map(|s| (s.sql, normalize_params(s.params)))
        .collect();
    let results = db.transaction(&statements).await.map_err(Error::Core)?;
    let results_json: Vec<JsonValue> = results.iter().map(to_execute_response).collect();
    Ok(Json(json!({ "results": results_json })))
}

/// Liveness probe: always 200 once the process is serving requests at all.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Readiness probe: always 200, `degraded` if any configured database's
/// pool has been closed.
pub async fn health_ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    let databases: Vec<DatabaseStatus> = state.statuses();
    let status = if databases.iter().any(|d| d.closed) {
        "degraded"
    } else {
        "ok"
    };
    Json(ReadyResponse { status, databases })
}
