//! Live log polling, live screenshot, and artifact file serving
//!
//! All three read from `<artifactRoot>/<runId>/<testKey>/`. The log
//! endpoint is a byte-offset polling contract: the offset returned is the
//! one the caller sends back next, so a client that accumulates `content`
//! never loses bytes.

use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::{error_json, map_error, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/:run_id/tests/:test_key/logs", get(poll_log_handler))
        .route("/:run_id/tests/:test_key/screenshot", get(screenshot_handler))
        .route(
            "/:run_id/tests/:test_key/artifacts/:filename",
            get(artifact_file_handler),
        )
}

/// A path component is safe when it cannot traverse out of its directory
fn is_safe_component(value: &str) -> bool {
    !value.is_empty() && !value.contains("..") && !value.contains('/') && !value.contains('\\')
}

fn test_artifact_dir(state: &AppState, run_id: &str, test_key: &str) -> Option<PathBuf> {
    if !is_safe_component(run_id) || !is_safe_component(test_key) {
        return None;
    }
    Some(state.config.artifact_root.join(run_id).join(test_key))
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    #[serde(default)]
    offset: u64,
}

#[derive(Debug, Serialize)]
struct LogChunk {
    content: String,
    offset: u64,
    finished: bool,
}

async fn poll_log_handler(
    State(state): State<AppState>,
    Path((run_id, test_key)): Path<(String, String)>,
    Query(query): Query<LogQuery>,
) -> Response {
    let Some(dir) = test_artifact_dir(&state, &run_id, &test_key) else {
        return error_json(StatusCode::BAD_REQUEST, "Invalid run or test identifier");
    };

    let test = match state.store.get_run_test(&run_id, &test_key) {
        Ok(Some(test)) => test,
        Ok(None) => {
            return error_json(
                StatusCode::NOT_FOUND,
                format!("test {test_key} not found in run {run_id}"),
            )
        }
        Err(e) => return map_error(e),
    };
    let finished = test.status.is_complete();

    let bytes = match tokio::fs::read(dir.join("console.log")).await {
        Ok(bytes) => bytes,
        // Not written yet (or already retained away): hold the offset
        Err(_) => {
            return (
                StatusCode::OK,
                Json(LogChunk {
                    content: String::new(),
                    offset: query.offset,
                    finished,
                }),
            )
                .into_response()
        }
    };

    let start = (query.offset as usize).min(bytes.len());
    let content = String::from_utf8_lossy(&bytes[start..]).into_owned();

    (
        StatusCode::OK,
        Json(LogChunk {
            content,
            offset: bytes.len() as u64,
            finished,
        }),
    )
        .into_response()
}

async fn screenshot_handler(
    State(state): State<AppState>,
    Path((run_id, test_key)): Path<(String, String)>,
) -> Response {
    let Some(dir) = test_artifact_dir(&state, &run_id, &test_key) else {
        return error_json(StatusCode::BAD_REQUEST, "Invalid run or test identifier");
    };

    match tokio::fs::read(dir.join("live.jpg")).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "image/jpeg")],
            bytes,
        )
            .into_response(),
        Err(_) => error_json(StatusCode::NOT_FOUND, "No live screenshot available"),
    }
}

async fn artifact_file_handler(
    State(state): State<AppState>,
    Path((run_id, test_key, filename)): Path<(String, String, String)>,
) -> Response {
    if !is_safe_component(&filename) {
        return error_json(StatusCode::BAD_REQUEST, "Invalid artifact filename");
    }
    let Some(dir) = test_artifact_dir(&state, &run_id, &test_key) else {
        return error_json(StatusCode::BAD_REQUEST, "Invalid run or test identifier");
    };

    match tokio::fs::read(dir.join(&filename)).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, guess_content_type(&filename))],
            bytes,
        )
            .into_response(),
        Err(_) => error_json(
            StatusCode::NOT_FOUND,
            format!("artifact not found: {filename}"),
        ),
    }
}

fn guess_content_type(filename: &str) -> &'static str {
    if filename.ends_with(".log") || filename.ends_with(".txt") {
        "text/plain; charset=utf-8"
    } else if filename.ends_with(".jpg") || filename.ends_with(".jpeg") {
        "image/jpeg"
    } else if filename.ends_with(".png") {
        "image/png"
    } else if filename.ends_with(".webm") {
        "video/webm"
    } else if filename.ends_with(".mp4") {
        "video/mp4"
    } else if filename.ends_with(".json") {
        "application/json"
    } else if filename.ends_with(".zip") {
        "application/zip"
    } else {
        "application/octet-stream"
    }
}
