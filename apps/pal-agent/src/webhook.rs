//! Webhook bridge: turns a signed repository event into a publication on
//! the webhook control topic.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::{info, warn};

use pal_topics::TOPIC_WEBHOOK;

use crate::AppState;

const EVENT_HEADER: &str = "x-github-event";
const TOKEN_HEADER: &str = "x-webhook-token";

pub(crate) async fn trigger_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !token_ok(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"type":"about:blank","title":"Unauthorized","status":401})),
        )
            .into_response();
    }

    let event = headers
        .get(EVENT_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("ping")
        .to_string();
    let urls = affected_repo_urls(&body);

    let watched = state
        .policy_repo_url
        .as_deref()
        .filter(|configured| urls.iter().any(|u| u == configured));
    if let (Some(repo_url), "push") = (watched, event.as_str()) {
        info!(repo = repo_url, hook_event = %event, "webhook triggered for watched repo");
        if let Err(err) = state.publisher.publish(TOPIC_WEBHOOK, None).await {
            warn!(%err, "failed to publish webhook control topic");
        }
        return Json(json!({"status": "ok", "event": event, "repo_url": repo_url})).into_response();
    }

    Json(json!({"status": "ignored", "event": event})).into_response()
}

/// Shared-secret check, constant time. No configured secret means the
/// endpoint refuses everything rather than accepting unsigned events.
fn token_ok(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(secret) = state.webhook_secret.as_deref() else {
        return false;
    };
    let Some(presented) = headers.get(TOKEN_HEADER).and_then(|h| h.to_str().ok()) else {
        return false;
    };
    ct_eq(secret.as_bytes(), presented.as_bytes())
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a.len() {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

/// Repository URLs a provider payload may refer to, in any of the
/// spellings GitHub-style webhooks use.
fn affected_repo_urls(body: &Value) -> Vec<String> {
    let repo = &body["repository"];
    ["url", "html_url", "clone_url", "git_url", "ssh_url"]
        .iter()
        .filter_map(|key| repo.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
        .collect()
}
