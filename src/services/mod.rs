// All service modules
pub mod catalog;
pub mod finalizer;
pub mod price_oracle;
pub mod pricing;
pub mod reservation;
pub mod scheduler;

// Re-export for convenience
pub use catalog::Catalog;
pub use finalizer::PurchaseFinalizer;
pub use price_oracle::PriceOracle;
pub use pricing::DiscountResolver;
pub use reservation::ReservationEngine;
pub use scheduler::JobScheduler;

use crate::{bot::BotFleet, config::Config, db::Database, integrations::solana_watcher::SolanaWatcher};
use std::sync::Arc;

/// Start all background services
pub async fn start_background_services(
    db: Database,
    config: Config,
    reservations: Arc<ReservationEngine>,
    finalizer: Arc<PurchaseFinalizer>,
    oracle: Arc<PriceOracle>,
    fleet: Arc<BotFleet>,
) {
    tracing::info!("Starting background services...");

    let scheduler = Arc::new(JobScheduler::new(
        reservations,
        finalizer.clone(),
        oracle,
        fleet,
    ));
    scheduler.start();

    // Direct-chain watcher is a no-op unless a wallet is configured.
    let watcher = Arc::new(SolanaWatcher::new(db, config, finalizer));
    watcher.start();

    tracing::info!("All background services started");
}
