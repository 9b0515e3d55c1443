// API server clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Watchdesk API Server
//!
//! REST API for contacts and invoices, plus the Stripe webhook receiver.

use std::net::SocketAddr;

use axum::http::{header, HeaderValue, Method};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use watchdesk_api::{create_router, AppState, Config, LogFormat};
use watchdesk_shared::{create_pool, run_migrations};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Load configuration before tracing so LOG_FORMAT applies
    let config = Config::from_env()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,watchdesk_api=debug".into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    tracing::info!("Starting Watchdesk API Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        provider = config.billing.provider.as_str(),
        sync_on_read_limit = config.billing.sync_on_read_limit,
        "Configuration loaded"
    );

    if config.billing.stripe.webhook_secret.is_none() {
        if config.billing.stripe.allow_unsigned_webhooks {
            tracing::warn!(
                "STRIPE_WEBHOOK_SECRET is not set and ALLOW_UNSIGNED_WEBHOOKS=true: \
                 webhook signatures will NOT be verified. Development use only."
            );
        } else {
            tracing::warn!("STRIPE_WEBHOOK_SECRET is not set: Stripe webhooks will be rejected");
        }
    }

    let pool = create_pool(&config.database_path).await?;
    tracing::info!("Running database migrations...");
    run_migrations(&pool).await?;
    tracing::info!("Database ready");

    let bind_address = config.bind_address.clone();
    let origin = HeaderValue::from_str(&config.app_base_url)?;
    let state = AppState::new(pool, config);

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list([origin]))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([header::CONTENT_TYPE]);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Parse bind address
    let addr: SocketAddr = bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
