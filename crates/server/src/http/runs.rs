//! Run endpoints

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use testdeck_common::types::{Run, RunStatus, RunTest, TriggerType};
use tracing::warn;

use super::{error_json, map_error, AppState};
use crate::store::{NewRun, RunFilter};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_run_handler).get(list_runs_handler))
        .route("/:run_id", get(get_run_handler))
        .route("/:run_id/cancel", post(cancel_run_handler))
        .merge(super::artifacts::router())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRunRequest {
    test_keys: Vec<String>,
    environment: String,
    user_email: String,
    #[serde(default)]
    run_overrides: Option<HashMap<String, Value>>,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn create_run_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateRunRequest>,
) -> Response {
    if request.user_email.trim().is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "userEmail is required");
    }
    if !state.policy.is_known_environment(&request.environment) {
        return error_json(
            StatusCode::BAD_REQUEST,
            format!("Unknown environment: {}", request.environment),
        );
    }
    if let Err(e) = state.policy.check(&request.user_email, &request.environment) {
        return map_error(e);
    }

    let (resolved, missing) = match state.store.resolve_active_tests(&request.test_keys) {
        Ok(result) => result,
        Err(e) => return map_error(e),
    };
    if !missing.is_empty() {
        warn!(
            "Run creation by {} dropped unknown test key(s): {:?}",
            request.user_email, missing
        );
    }
    if resolved.is_empty() {
        return error_json(
            StatusCode::BAD_REQUEST,
            "No active tests matched the requested test keys",
        );
    }

    let new_run = NewRun {
        trigger_type: TriggerType::Manual,
        environment: request.environment,
        schedule_id: None,
        triggered_by_email: Some(request.user_email),
        run_overrides: request.run_overrides,
        metadata: request.metadata,
        tests: resolved
            .into_iter()
            .map(|def| (def.id, def.test_key))
            .collect(),
    };

    match state.store.create_run(&new_run) {
        Ok(run) => (StatusCode::CREATED, Json(run)).into_response(),
        Err(e) => map_error(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListRunsQuery {
    status: Option<String>,
    environment: Option<String>,
    page: Option<i64>,
    page_size: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunListResponse {
    runs: Vec<Run>,
    total: i64,
    page: i64,
    page_size: i64,
}

async fn list_runs_handler(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Response {
    let status = match query.status.as_deref() {
        Some(raw) => match raw.parse::<RunStatus>() {
            Ok(status) => Some(status),
            Err(e) => return map_error(e),
        },
        None => None,
    };

    let filter = RunFilter {
        status,
        environment: query.environment,
        page: query.page.unwrap_or(1),
        page_size: query.page_size.unwrap_or(20),
    };

    match state.store.list_runs(&filter) {
        Ok(page) => (
            StatusCode::OK,
            Json(RunListResponse {
                runs: page.runs,
                total: page.total,
                page: page.page,
                page_size: page.page_size,
            }),
        )
            .into_response(),
        Err(e) => map_error(e),
    }
}

#[derive(Debug, Serialize)]
struct RunWithTests {
    #[serde(flatten)]
    run: Run,
    tests: Vec<RunTest>,
}

async fn get_run_handler(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    let run = match state.store.get_run(&run_id) {
        Ok(Some(run)) => run,
        Ok(None) => return error_json(StatusCode::NOT_FOUND, format!("run not found: {run_id}")),
        Err(e) => return map_error(e),
    };
    match state.store.list_run_tests(&run_id) {
        Ok(tests) => (StatusCode::OK, Json(RunWithTests { run, tests })).into_response(),
        Err(e) => map_error(e),
    }
}

/// Flip the run to cancelled and promote its still-pending tests to
/// skipped. A test already running completes naturally; the executor
/// observes the flip between tests.
async fn cancel_run_handler(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Response {
    if let Err(e) = state.store.cancel_run(&run_id) {
        return map_error(e);
    }
    if let Err(e) = state.store.skip_pending_tests(&run_id) {
        return map_error(e);
    }
    (StatusCode::OK, Json(json!({"success": true}))).into_response()
}
