//! Dashboard endpoints
//!
//! Thin adapters over the aggregation engine. `days` defaults to 30 and is
//! clamped to 1-365 here, at the HTTP boundary.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use testdeck_common::time::now_ms;

use super::{error_json, map_error, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/active-runs", get(active_runs_handler))
        .route("/pass-rate", get(pass_rate_handler))
        .route("/executions", get(executions_handler))
        .route("/flaky-tests", get(flaky_tests_handler))
        .route("/environment-health", get(environment_health_handler))
        .route("/tests/:test_key/stats", get(test_stats_handler))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WindowQuery {
    days: Option<i64>,
    min_executions: Option<i64>,
}

impl WindowQuery {
    fn days(&self) -> i64 {
        self.days.unwrap_or(30).clamp(1, 365)
    }

    fn min_executions(&self) -> i64 {
        self.min_executions.unwrap_or(5).max(1)
    }
}

async fn active_runs_handler(State(state): State<AppState>) -> Response {
    match state.aggregator.active_runs() {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => map_error(e),
    }
}

async fn pass_rate_handler(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Response {
    match state.aggregator.pass_rate(query.days(), now_ms()) {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => map_error(e),
    }
}

async fn executions_handler(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Response {
    match state.aggregator.total_executions(query.days(), now_ms()) {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => map_error(e),
    }
}

async fn flaky_tests_handler(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Response {
    match state
        .aggregator
        .flaky_tests(query.days(), query.min_executions(), now_ms())
    {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => map_error(e),
    }
}

async fn environment_health_handler(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Response {
    match state.aggregator.environment_health(query.days(), now_ms()) {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => map_error(e),
    }
}

async fn test_stats_handler(
    State(state): State<AppState>,
    Path(test_key): Path<String>,
    Query(query): Query<WindowQuery>,
) -> Response {
    // Stats for a key the catalog has never seen are a 404, not zeros
    match state.store.get_test_by_key(&test_key) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_json(
                StatusCode::NOT_FOUND,
                format!("test definition not found: {test_key}"),
            )
        }
        Err(e) => return map_error(e),
    }

    match state.aggregator.test_stats(&test_key, query.days(), now_ms()) {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => map_error(e),
    }
}
