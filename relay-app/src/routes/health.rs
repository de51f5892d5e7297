use crate::server::AppState;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(
    Extension(state): Extension<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let store = state.store.ping().await;
    let snapshot = state.dispatcher.snapshot().await;
    let ready = store.is_ok();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = serde_json::json!({
        "status": if ready { "ok" } else { "degraded" },
        "ready": ready,
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "checks": {
            "store": {
                "backend": state.store_backend,
                "ok": ready,
                "error": store.err().map(|e| e.to_string()),
            },
            "dispatch": {
                "pending_chains": snapshot.pending_chains,
                "active_chats": snapshot.active_chats,
            }
        }
    });
    (status, Json(body))
}
