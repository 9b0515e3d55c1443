// Worker clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Watchdesk Background Worker
//!
//! Handles scheduled jobs:
//! - Pull reconciliation of unsettled invoices (every 15 minutes)
//! - Invariant checks over invoices and contacts (daily at 3:00 AM UTC)

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use watchdesk_billing::BillingService;
use watchdesk_shared::{create_pool, run_migrations};

/// Invoices re-fetched per reconciliation run
const DEFAULT_RECONCILE_BATCH: i64 = 100;

fn reconcile_batch_size() -> anyhow::Result<i64> {
    match std::env::var("RECONCILE_BATCH_SIZE") {
        Ok(value) => {
            let size: i64 = value.trim().parse()?;
            anyhow::ensure!(size > 0, "RECONCILE_BATCH_SIZE must be positive");
            Ok(size)
        }
        Err(_) => Ok(DEFAULT_RECONCILE_BATCH),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Watchdesk Worker");

    let database_path =
        std::env::var("DATABASE_PATH").unwrap_or_else(|_| "watchdesk.db".to_string());
    let pool = create_pool(&database_path).await?;
    run_migrations(&pool).await?;

    let billing = Arc::new(BillingService::from_env(pool)?);
    let batch_size = reconcile_batch_size()?;

    let scheduler = JobScheduler::new().await?;

    // Job 1: Pull reconciliation of unsettled invoices
    // Cron: every 15 minutes
    let reconcile_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = reconcile_billing.clone();
            Box::pin(async move {
                info!(batch_size = batch_size, "Running scheduled invoice reconciliation");
                jobs::reconcile_open_invoices(&billing, batch_size).await;
            })
        })?)
        .await?;
    info!("Scheduled: Invoice reconciliation (every 15 minutes)");

    // Job 2: Invariant checks
    // Cron: At 3:00 AM UTC every day
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running scheduled invariant checks");
                jobs::check_invariants(&billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Invariant checks (daily at 3:00 AM UTC)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Watchdesk Worker started successfully with {} scheduled jobs", 2);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
