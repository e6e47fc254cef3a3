use super::AppState;
use crate::{constants::IPN_MAX_BODY_BYTES, error::AppError};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

/// POST /webhook: payment gateway IPN sink.
///
/// 200 on accept (including already-processed replays), 400 on signature or
/// parse failure, 413 on oversize, 503 while booting. Signature checks run
/// against the raw body before any re-serialization.
pub async fn nowpayments_ipn(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.is_booted() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if body.len() > IPN_MAX_BODY_BYTES {
        tracing::warn!("IPN rejected: body of {} bytes exceeds limit", body.len());
        return AppError::PayloadTooLarge.into_response();
    }

    let signature = headers
        .get("x-nowpayments-sig")
        .and_then(|v| v.to_str().ok());

    let event = match state.gateway.parse_ipn(signature, &body) {
        Ok(event) => event,
        Err(err @ AppError::InvalidSignature) => {
            tracing::warn!("IPN rejected: signature verification failed");
            return err.into_response();
        }
        Err(err) => {
            tracing::warn!("IPN rejected: {}", err);
            return err.into_response();
        }
    };

    tracing::info!(
        "IPN received: payment {} status {:?}",
        event.payment_id,
        event.status
    );

    match state.finalizer.on_payment_event(event).await {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(err @ AppError::BadRequest(_)) => err.into_response(),
        Err(err) => {
            tracing::error!("IPN processing error: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, "Processing error").into_response()
        }
    }
}
