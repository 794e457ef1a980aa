//! Axum router construction.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the server router.
///
/// - `GET /health` -- liveness and sync status
/// - `GET /ws` -- authenticated `WebSocket` for chat, presence and events
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/ws", get(ws::ws_connect))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
