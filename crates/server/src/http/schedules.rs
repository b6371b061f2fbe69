//! Schedule CRUD endpoints

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use testdeck_common::types::Selector;

use super::{error_json, map_error, AppState};
use crate::scheduler::parse_cron;
use crate::store::{NewSchedule, ScheduleUpdate};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_schedules_handler).post(create_schedule_handler))
        .route(
            "/:schedule_id",
            get(get_schedule_handler)
                .put(update_schedule_handler)
                .delete(delete_schedule_handler),
        )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleRequest {
    name: String,
    cron: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    environment: String,
    selector: Selector,
    #[serde(default)]
    default_run_overrides: Option<HashMap<String, Value>>,
    user_email: String,
}

fn default_enabled() -> bool {
    true
}

/// Shared create/update validation: name shape, cron shape, environment
/// existence, and environment access for the calling user.
fn validate_request(state: &AppState, request: &ScheduleRequest) -> Option<Response> {
    if request.name.trim().is_empty() {
        return Some(error_json(StatusCode::BAD_REQUEST, "name is required"));
    }
    if request.user_email.trim().is_empty() {
        return Some(error_json(StatusCode::BAD_REQUEST, "userEmail is required"));
    }
    if let Err(e) = parse_cron(&request.cron) {
        return Some(map_error(e));
    }
    if !state.policy.is_known_environment(&request.environment) {
        return Some(error_json(
            StatusCode::BAD_REQUEST,
            format!("Unknown environment: {}", request.environment),
        ));
    }
    if let Err(e) = state.policy.check(&request.user_email, &request.environment) {
        return Some(map_error(e));
    }
    None
}

async fn list_schedules_handler(State(state): State<AppState>) -> Response {
    match state.store.list_schedules() {
        Ok(schedules) => {
            (StatusCode::OK, Json(json!({"schedules": schedules}))).into_response()
        }
        Err(e) => map_error(e),
    }
}

async fn create_schedule_handler(
    State(state): State<AppState>,
    Json(request): Json<ScheduleRequest>,
) -> Response {
    if let Some(rejection) = validate_request(&state, &request) {
        return rejection;
    }

    let new = NewSchedule {
        name: request.name,
        cron: request.cron,
        enabled: request.enabled,
        environment: request.environment,
        selector: request.selector,
        default_run_overrides: request.default_run_overrides,
        created_by_email: Some(request.user_email),
    };

    match state.store.create_schedule(&new) {
        Ok(schedule) => (StatusCode::CREATED, Json(schedule)).into_response(),
        Err(e) => map_error(e),
    }
}

async fn get_schedule_handler(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
) -> Response {
    match state.store.get_schedule(&schedule_id) {
        Ok(Some(schedule)) => (StatusCode::OK, Json(schedule)).into_response(),
        Ok(None) => error_json(
            StatusCode::NOT_FOUND,
            format!("schedule not found: {schedule_id}"),
        ),
        Err(e) => map_error(e),
    }
}

async fn update_schedule_handler(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
    Json(request): Json<ScheduleRequest>,
) -> Response {
    if let Some(rejection) = validate_request(&state, &request) {
        return rejection;
    }

    let update = ScheduleUpdate {
        name: request.name,
        cron: request.cron,
        enabled: request.enabled,
        environment: request.environment,
        selector: request.selector,
        default_run_overrides: request.default_run_overrides,
        updated_by_email: Some(request.user_email),
    };

    match state.store.update_schedule(&schedule_id, &update) {
        Ok(schedule) => (StatusCode::OK, Json(schedule)).into_response(),
        Err(e) => map_error(e),
    }
}

async fn delete_schedule_handler(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
) -> Response {
    match state.store.delete_schedule(&schedule_id) {
        Ok(true) => (StatusCode::OK, Json(json!({"success": true}))).into_response(),
        Ok(false) => error_json(
            StatusCode::NOT_FOUND,
            format!("schedule not found: {schedule_id}"),
        ),
        Err(e) => map_error(e),
    }
}
