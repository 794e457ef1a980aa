//! Plain HTTP handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use serde_json::{Value, json};

use crate::state::AppState;

/// Liveness and sync status.
///
/// # Route
///
/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let sync = *state.sync.borrow();
    let uptime_secs = Utc::now()
        .signed_duration_since(state.started_at)
        .num_seconds()
        .max(0);
    Json(json!({
        "status": "ok",
        "hub": state.hub.id(),
        "sync": sync.as_str(),
        "uptime_secs": uptime_secs,
    }))
}
