//! HTTP surface
//!
//! Thin JSON/byte adapters over the store, aggregator, and artifact tree.
//! Error shape is `{"error": string}` throughout; validation maps to 400,
//! access denial to 403, unknown entities to 404.

mod artifacts;
mod catalog;
mod dashboard;
mod runs;
mod schedules;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use testdeck_common::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::access::AccessPolicy;
use crate::aggregate::Aggregator;
use crate::config::AppConfig;
use crate::store::Store;

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub aggregator: Aggregator,
    pub policy: Arc<AccessPolicy>,
    pub config: Arc<AppConfig>,
}

/// Build the full application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/environments", get(environments_handler))
        .nest("/api/tests", catalog::router())
        .nest("/api/runs", runs::router())
        .nest("/api/schedules", schedules::router())
        .nest("/api/dashboard", dashboard::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

/// Bind and serve until the process shuts down
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    info!("HTTP API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}

async fn environments_handler(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        Json(json!({"environments": state.policy.environments()})),
    )
        .into_response()
}

/// `{"error": ...}` with the given status
pub(crate) fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

/// Map a domain error to its HTTP shape
pub(crate) fn map_error(err: Error) -> Response {
    match &err {
        Error::NotFound { .. } => error_json(StatusCode::NOT_FOUND, err.to_string()),
        Error::AccessDenied { .. } => error_json(StatusCode::FORBIDDEN, err.to_string()),
        Error::Validation(_)
        | Error::InvalidConfig(_)
        | Error::InvalidCron { .. }
        | Error::InvalidStateTransition { .. } => {
            error_json(StatusCode::BAD_REQUEST, err.to_string())
        }
        _ => {
            error!("Internal error: {}", err);
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}
