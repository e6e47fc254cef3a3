pub mod admin;
pub mod health;
pub mod telegram;
pub mod webhook;

use crate::{
    bot::{BotFleet, SessionStore},
    config::Config,
    db::Database,
    integrations::nowpayments::NowPaymentsClient,
    services::{Catalog, DiscountResolver, PriceOracle, PurchaseFinalizer, ReservationEngine},
};
use axum::http::HeaderMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::error::{AppError, Result};

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Config,
    pub fleet: Arc<BotFleet>,
    pub gateway: Arc<NowPaymentsClient>,
    pub oracle: Arc<PriceOracle>,
    pub finalizer: Arc<PurchaseFinalizer>,
    pub reservations: Arc<ReservationEngine>,
    pub resolver: Arc<DiscountResolver>,
    pub catalog: Arc<Catalog>,
    pub sessions: Arc<SessionStore>,
    /// False until transports and background services are up; the webhook
    /// answers 503 meanwhile so the gateway retries later.
    pub booted: Arc<AtomicBool>,
}

impl AppState {
    pub fn is_booted(&self) -> bool {
        self.booted.load(Ordering::Acquire)
    }

    pub fn mark_booted(&self) {
        self.booted.store(true, Ordering::Release);
    }
}

/// Admin endpoints require the configured key in `x-admin-key`. With no key
/// configured the surface is disabled outright. The comparison is
/// constant-time; only the key length can leak.
pub fn require_admin_key(headers: &HeaderMap, state: &AppState) -> Result<()> {
    let Some(expected) = &state.config.admin_api_key else {
        return Err(AppError::Unauthorized(
            "Admin API is not enabled".to_string(),
        ));
    };

    let provided = headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing x-admin-key header".to_string()))?;

    if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        return Err(AppError::Unauthorized("Invalid admin key".to_string()));
    }
    Ok(())
}
