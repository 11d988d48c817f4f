//! HTTP routes

pub mod ws;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use sauti_core::Error;

use crate::error::ApiError;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/ws", get(ws::ws_handler))
        .route("/v1/sessions/:id", get(session_info))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "active_conversations": state.relay.conversation_count(),
    }))
}

/// Inspection endpoint for a live session
async fn session_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let snapshot = state
        .relay
        .snapshot(&id)
        .ok_or_else(|| ApiError::from(Error::ConversationNotFound(id)))?;
    Ok(Json(json!({
        "session_id": snapshot.id,
        "phase": format!("{:?}", snapshot.phase),
        "turn_count": snapshot.turn_count,
        "queued_responses": snapshot.queued_responses,
        "age_secs": snapshot.age.as_secs_f64(),
        "idle_secs": snapshot.idle_for.as_secs_f64(),
    })))
}
