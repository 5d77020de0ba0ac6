//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use super::ApiError;
use crate::runs::RunStatus;
use crate::scores::OVERALL;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/batches/{batch_id}/rankings", get(batch_rankings))
        .route("/batches/{batch_id}/scores", post(compute_batch).delete(clear_batch))
        .route(
            "/batches/{batch_id}/models/{model_id}/scores",
            get(model_scores).post(compute_model),
        )
        .route("/runs", get(list_runs))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

#[derive(Debug, Deserialize)]
struct RankingParams {
    score_type: Option<String>,
}

async fn batch_rankings(
    State(state): State<AppState>,
    Path(batch_id): Path<i64>,
    Query(params): Query<RankingParams>,
) -> Result<Json<Value>, ApiError> {
    let score_type = params.score_type.unwrap_or_else(|| OVERALL.to_string());
    let lookup = score_type.clone();
    let rankings = tokio::task::spawn_blocking(move || {
        state.aggregator.rank_models_in_batch(batch_id, Some(&lookup))
    })
    .await??;

    Ok(Json(json!({
        "data": rankings,
        "meta": { "batch_id": batch_id, "score_type": score_type, "total": rankings.len() }
    })))
}

async fn model_scores(
    State(state): State<AppState>,
    Path((batch_id, model_id)): Path<(i64, i64)>,
) -> Result<Json<Value>, ApiError> {
    let details = tokio::task::spawn_blocking(move || {
        state.aggregator.model_score_details(batch_id, model_id)
    })
    .await??;
    Ok(Json(json!({ "data": details, "meta": meta() })))
}

async fn compute_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let summary =
        tokio::task::spawn_blocking(move || state.aggregator.compute_for_batch(batch_id)).await??;
    Ok(Json(json!({
        "data": summary,
        "meta": { "batch_id": batch_id, "models": summary.computed.len() + summary.failed.len() }
    })))
}

async fn compute_model(
    State(state): State<AppState>,
    Path((batch_id, model_id)): Path<(i64, i64)>,
) -> Result<Json<Value>, ApiError> {
    let rows = tokio::task::spawn_blocking(move || {
        state.aggregator.compute_for_model(batch_id, model_id)
    })
    .await??;
    Ok(Json(json!({
        "data": { "batch_id": batch_id, "model_id": model_id, "rows": rows },
        "meta": meta()
    })))
}

async fn clear_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let removed =
        tokio::task::spawn_blocking(move || state.aggregator.clear_for_batch(batch_id)).await??;
    Ok(Json(json!({
        "data": { "batch_id": batch_id, "removed": removed },
        "meta": meta()
    })))
}

#[derive(Debug, Deserialize)]
struct RunParams {
    status: Option<String>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<RunParams>,
) -> Result<Json<Value>, ApiError> {
    let status = params
        .status
        .map(|s| s.parse::<RunStatus>())
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let runs = tokio::task::spawn_blocking(move || state.runs.list(status)).await??;
    Ok(Json(json!({ "data": runs, "meta": { "total": runs.len() } })))
}
