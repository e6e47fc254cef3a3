use crate::{
    bot::BotFleet,
    constants::{
        ABANDONED_SWEEP_INTERVAL_SECS, BASKET_SWEEP_INTERVAL_SECS, BOT_HEALTH_INTERVAL_SECS,
        DEPOSIT_EXPIRY_INTERVAL_SECS, PRICE_REFRESH_INTERVAL_SECS,
    },
    services::{
        finalizer::PurchaseFinalizer, price_oracle::PriceOracle, reservation::ReservationEngine,
    },
};
use std::sync::Arc;
use tokio::time::{interval, Duration};

/// Periodic maintenance. Every job is idempotent and overlap-safe; a failed
/// tick logs and waits for the next one.
pub struct JobScheduler {
    reservations: Arc<ReservationEngine>,
    finalizer: Arc<PurchaseFinalizer>,
    oracle: Arc<PriceOracle>,
    fleet: Arc<BotFleet>,
}

impl JobScheduler {
    pub fn new(
        reservations: Arc<ReservationEngine>,
        finalizer: Arc<PurchaseFinalizer>,
        oracle: Arc<PriceOracle>,
        fleet: Arc<BotFleet>,
    ) -> Self {
        Self {
            reservations,
            finalizer,
            oracle,
            fleet,
        }
    }

    pub fn start(self: Arc<Self>) {
        self.clone().spawn_basket_sweep();
        self.clone().spawn_deposit_expiry();
        self.clone().spawn_abandoned_sweep();
        self.clone().spawn_price_refresh();
        self.spawn_bot_health();
    }

    fn spawn_basket_sweep(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(BASKET_SWEEP_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                if let Err(err) = self.reservations.release_expired_all().await {
                    tracing::error!("Basket expiry sweep error: {}", err);
                }
            }
        });
    }

    fn spawn_deposit_expiry(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(DEPOSIT_EXPIRY_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                if let Err(err) = self.finalizer.expire_stale_deposits().await {
                    tracing::error!("Pending deposit expiry error: {}", err);
                }
            }
        });
    }

    fn spawn_abandoned_sweep(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(ABANDONED_SWEEP_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                match self.reservations.clean_abandoned_reservations().await {
                    Ok(0) => {}
                    Ok(n) => tracing::warn!("Abandoned-reservation sweep clamped {} product(s)", n),
                    Err(err) => tracing::error!("Abandoned-reservation sweep error: {}", err),
                }
            }
        });
    }

    fn spawn_price_refresh(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(PRICE_REFRESH_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                self.oracle.refresh_all().await;
            }
        });
    }

    fn spawn_bot_health(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(BOT_HEALTH_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                self.fleet.health_check_all().await;
            }
        });
    }
}
