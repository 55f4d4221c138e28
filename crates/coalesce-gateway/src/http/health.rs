use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness check with debounce status.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": state.debouncer.mode(),
        "store": state.store.as_ref().map(|s| s.backend().to_string()),
        "pending_bursts": state.debouncer.pending(),
        "leader_duties": state.duties.len(),
        "sink_enabled": state.dispatcher.is_enabled(),
        "filter_active": state.filter.is_active(),
    }))
}
