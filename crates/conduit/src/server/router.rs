//! HTTP Router
//!
//! Sets up the axum router with the per-plugin WebSocket endpoint and the
//! status endpoints.

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handler::handle_websocket;
use super::state::AppState;
use crate::instance::PluginSummary;
use crate::store::validate_plugin_id;

/// Create the application router
pub fn create_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        // One WebSocket per plugin id
        .route("/ws/:plugin_id", get(ws_upgrade))
        // Health check for monitoring/load balancers
        .route("/health", get(health_check))
        .route("/plugins", get(list_plugins))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// WebSocket upgrade handler
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(plugin_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    if let Err(e) = validate_plugin_id(&plugin_id) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    ws.on_upgrade(move |socket| handle_websocket(socket, state, plugin_id))
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    plugins: Vec<String>,
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        plugins: state.registry().list(),
    })
}

/// Detailed status of every loaded plugin
async fn list_plugins(State(state): State<AppState>) -> Json<Vec<PluginSummary>> {
    Json(state.registry().describe())
}
