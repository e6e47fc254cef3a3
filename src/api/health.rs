use super::AppState;
use axum::{extract::State, Json};
use serde_json::json;

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": if state.is_booted() { "ok" } else { "starting" },
    }))
}
