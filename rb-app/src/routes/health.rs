use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "replies": {
            "pending": state.coordinator.debounce().pending_count(),
            "running": state.coordinator.supervisor().active_count(),
        },
        "inbound_queue_capacity": state.inbound_tx.capacity(),
    }))
}
