use super::AppState;
use crate::bot::handlers;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use teloxide::types::Update;

/// POST /telegram/{token}: per-bot update sink. The token in the path picks
/// the transport; unknown tokens get a 404. Handling is spawned so Telegram
/// gets its 200 immediately.
pub async fn update_sink(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(update): Json<Update>,
) -> Response {
    if !state.is_booted() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let Some((bot_id, bot)) = state.fleet.bot_for_token(&token).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    tokio::spawn(handlers::handle_update(state.clone(), bot, bot_id, update));
    StatusCode::OK.into_response()
}
