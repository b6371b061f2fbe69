//! Catalog endpoints

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use testdeck_common::types::ConfigSet;

use super::{error_json, map_error, AppState};
use crate::store::CatalogFilter;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tests_handler))
        .route("/tags", get(list_tags_handler))
        .route("/folders", get(list_folders_handler))
        .route("/:test_key", get(get_test_handler))
        .route("/:test_key/overrides", put(update_overrides_handler))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTestsQuery {
    folder_prefix: Option<String>,
    /// Comma-separated; a test matches when it carries any of them
    tags: Option<String>,
}

async fn list_tests_handler(
    State(state): State<AppState>,
    Query(query): Query<ListTestsQuery>,
) -> Response {
    let tags = query.tags.map(|raw| {
        raw.split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
    });

    let filter = CatalogFilter {
        folder_prefix: query.folder_prefix,
        tags,
    };

    match state.store.list_tests(&filter) {
        Ok(tests) => (StatusCode::OK, Json(json!({"tests": tests}))).into_response(),
        Err(e) => map_error(e),
    }
}

async fn list_tags_handler(State(state): State<AppState>) -> Response {
    match state.store.list_tags() {
        Ok(tags) => (StatusCode::OK, Json(json!({"tags": tags}))).into_response(),
        Err(e) => map_error(e),
    }
}

async fn list_folders_handler(State(state): State<AppState>) -> Response {
    match state.store.list_folder_paths() {
        Ok(folders) => (StatusCode::OK, Json(json!({"folders": folders}))).into_response(),
        Err(e) => map_error(e),
    }
}

async fn get_test_handler(
    State(state): State<AppState>,
    Path(test_key): Path<String>,
) -> Response {
    match state.store.get_test_by_key(&test_key) {
        Ok(Some(test)) => (StatusCode::OK, Json(test)).into_response(),
        Ok(None) => error_json(
            StatusCode::NOT_FOUND,
            format!("test definition not found: {test_key}"),
        ),
        Err(e) => map_error(e),
    }
}

/// Replace a test's overrides wholesale. `null` clears them.
async fn update_overrides_handler(
    State(state): State<AppState>,
    Path(test_key): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let overrides = match &body {
        Value::Null => None,
        Value::Object(_) => match serde_json::from_value::<ConfigSet>(body.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                return error_json(
                    StatusCode::BAD_REQUEST,
                    format!("overrides must have shared/environments shape: {e}"),
                )
            }
        },
        _ => {
            return error_json(
                StatusCode::BAD_REQUEST,
                "overrides must be a JSON object or null",
            )
        }
    };

    match state
        .store
        .set_test_overrides(&test_key, overrides.as_ref())
    {
        Ok(test) => (StatusCode::OK, Json(test)).into_response(),
        Err(e) => map_error(e),
    }
}
