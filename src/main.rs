use axum::{
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod bot;
mod config;
mod constants;
mod db;
mod error;
mod integrations;
mod models;
mod services;
mod utils;

use axum::http::HeaderValue;
use bot::{BotFleet, SessionStore};
use config::Config;
use db::Database;
use integrations::nowpayments::NowPaymentsClient;
use services::{
    Catalog, DiscountResolver, PriceOracle, PurchaseFinalizer, ReservationEngine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "dropbot_backend=info,tower_http=warn,sqlx::query=error".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    config.validate()?;

    tracing::info!("Starting drop-shop backend");
    tracing::info!("Environment: {}", config.environment);
    tracing::info!(
        "Basket timeout: {} min, deposit lifetime: {} min",
        config.basket_timeout_minutes,
        config.pending_deposit_lifetime_minutes
    );

    tokio::fs::create_dir_all(&config.media_dir).await?;

    let db = Database::new(&config).await?;
    tracing::info!("Running database migrations...");
    db.run_migrations().await?;

    let fleet = Arc::new(BotFleet::new(config.clone(), db.clone()));
    let gateway = Arc::new(NowPaymentsClient::new(&config));
    let oracle = Arc::new(PriceOracle::new(db.clone(), &config));
    let reservations = Arc::new(ReservationEngine::new(db.clone(), config.clone()));
    let resolver = Arc::new(DiscountResolver::new(db.clone()));
    let catalog = Arc::new(Catalog::new(db.clone()));
    catalog.refresh().await?;

    let finalizer = Arc::new(PurchaseFinalizer::new(
        db.clone(),
        config.clone(),
        gateway.clone(),
        oracle.clone(),
        fleet.clone(),
        reservations.clone(),
        resolver.clone(),
    ));

    let app_state = api::AppState {
        db: db.clone(),
        config: config.clone(),
        fleet: fleet.clone(),
        gateway,
        oracle: oracle.clone(),
        finalizer: finalizer.clone(),
        reservations: reservations.clone(),
        resolver,
        catalog,
        sessions: Arc::new(SessionStore::new()),
        booted: Arc::new(AtomicBool::new(false)),
    };

    let app = build_router(app_state.clone());

    // Bring up the transports before accepting webhook traffic.
    fleet.start().await?;

    services::start_background_services(
        db,
        config.clone(),
        reservations,
        finalizer,
        oracle,
        fleet,
    )
    .await;

    app_state.mark_booted();

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: api::AppState) -> Router {
    let cors = cors_from_config(&state.config);

    Router::new()
        // Health check
        .route("/health", get(api::health::health_check))
        // Payment gateway IPN
        .route("/webhook", post(api::webhook::nowpayments_ipn))
        // Per-bot update sink
        .route("/telegram/{token}", post(api::telegram::update_sink))
        // Admin (manual maintenance; consumes core APIs only)
        .route("/api/v1/admin/products", post(api::admin::create_product))
        .route(
            "/api/v1/admin/products/{id}",
            axum::routing::delete(api::admin::delete_product),
        )
        .route(
            "/api/v1/admin/products/{id}/media",
            post(api::admin::add_product_media),
        )
        .route(
            "/api/v1/admin/discounts",
            post(api::admin::create_discount_code),
        )
        .route(
            "/api/v1/admin/discounts/{code}/toggle",
            post(api::admin::toggle_discount_code),
        )
        .route("/api/v1/admin/resellers", put(api::admin::upsert_reseller_rule))
        .route(
            "/api/v1/admin/deposits",
            get(api::admin::list_pending_deposits),
        )
        .route(
            "/api/v1/admin/deposits/{payment_id}/recover",
            post(api::admin::recover_deposit),
        )
        .route("/api/v1/admin/inventory", get(api::admin::inventory_summary))
        .route("/api/v1/admin/sales/{days}", get(api::admin::sales_totals))
        .route("/api/v1/admin/broadcast", post(api::admin::broadcast))
        .route("/api/v1/admin/ban", post(api::admin::set_banned))
        .route("/api/v1/admin/log", get(api::admin::admin_log))
        .layer(cors)
        .with_state(state)
}

fn cors_from_config(config: &Config) -> CorsLayer {
    let raw = config.cors_allowed_origins.trim();
    if raw.is_empty() || raw == "*" {
        return CorsLayer::very_permissive();
    }

    let allowed: Vec<HeaderValue> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<HeaderValue>().ok())
        .collect();

    if allowed.is_empty() {
        tracing::warn!("No valid CORS origins parsed; falling back to permissive");
        return CorsLayer::very_permissive();
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}
