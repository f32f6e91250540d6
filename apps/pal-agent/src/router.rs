use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::webhook;
use crate::AppState;

/// Health probe; deliberately outside any documented API surface.
async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

pub(crate) fn build_router() -> Router<AppState> {
    Router::new()
        .route("/", get(healthcheck))
        .route("/healthcheck", get(healthcheck))
        .route("/webhook", post(webhook::trigger_webhook))
}
