//! BridgePay API Server
//!
//! Serves onboarding callbacks, inbound CRM/PSP webhooks, checkout
//! preference creation, and manual reconciliation runs.

use std::net::SocketAddr;

use bridgepay_api::{routes::create_router, AppState, Config};
use bridgepay_sync::SyncService;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,bridgepay_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting BridgePay API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = bridgepay_shared::create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    // Migrations run on a separate pool with longer timeouts
    tracing::info!("Running database migrations...");
    let migration_pool = bridgepay_shared::create_migration_pool(&config.database_url).await?;
    bridgepay_shared::run_migrations(&migration_pool).await?;
    migration_pool.close().await;
    tracing::info!("Database migrations complete");

    let sync = SyncService::from_env(pool.clone())?;
    let state = AppState::new(pool, config.clone(), sync);

    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
