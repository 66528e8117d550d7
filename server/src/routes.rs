use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;

use crate::chat::history;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // WebSocket endpoint (auth via query param or bearer header)
    let ws_routes = Router::new().route("/ws", get(ws_handler::ws_upgrade));

    // History views (AuthUser extractor validates the bearer token)
    let chat_routes = Router::new()
        .route("/api/chat/{id}", get(history::get_chat_history))
        .route("/api/messages", get(history::get_recent_chats));

    // Health check
    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(ws_routes)
        .merge(chat_routes)
        .merge(health)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
