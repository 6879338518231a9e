//! HTTP surface: health, the WebSocket upgrade, and the external-agent
//! callback ingress.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;

use parlor_domain::error::Error;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(crate::ws::ws_handler))
        .route(
            "/external/sessions/:session_id/messages",
            post(external_callback),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "agents": state.hub.agents.list().len(),
        "cachedSessions": state.hub.cached_session_count(),
    }))
}

/// External agents answer here (the `callbackUrl` handed to them on each
/// delivered user message).
async fn external_callback(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    match state.hub.handle_external_callback(&session_id, &payload) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"ok": true}))).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

fn error_response(err: &Error) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err.code() {
        "session_not_found" | "agent_not_found" => StatusCode::NOT_FOUND,
        "invalid_arguments" | "invalid_event" | "session_mismatch" => StatusCode::BAD_REQUEST,
        "rate_limited" => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({"code": err.code(), "message": err.to_string()})),
    )
}
