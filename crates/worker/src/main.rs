//! BridgePay Background Worker
//!
//! Handles scheduled jobs including:
//! - Daily payment reconciliation against the PSP (02:10 UTC)
//! - Stale correlation-token purge (hourly)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use bridgepay_sync::{Platform, SyncService};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting BridgePay Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = bridgepay_shared::create_pool(&database_url).await?;

    let sync = Arc::new(SyncService::from_env(pool)?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Daily reconciliation for every connected PSP account.
    // Runs after the PSP's own settlement cycle has quieted down.
    let reconcile_sync = sync.clone();
    scheduler
        .add(Job::new_async("0 10 2 * * *", move |_uuid, _l| {
            let sync = reconcile_sync.clone();
            Box::pin(async move {
                info!("Running scheduled payment reconciliation");
                run_reconciliation(&sync).await;
            })
        })?)
        .await?;
    info!("Scheduled: Payment reconciliation (daily at 02:10 UTC)");

    // Job 2: Purge correlation tokens from abandoned onboarding flows (hourly)
    let purge_sync = sync.clone();
    scheduler
        .add(Job::new_async("0 35 * * * *", move |_uuid, _l| {
            let sync = purge_sync.clone();
            Box::pin(async move {
                match sync
                    .onboarding
                    .purge_stale_tokens(time::Duration::hours(24))
                    .await
                {
                    Ok(purged) if purged > 0 => {
                        info!(purged = purged, "Correlation token purge complete")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Correlation token purge failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Correlation token purge (hourly)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("BridgePay Worker started successfully with 3 scheduled jobs");

    // Keep the main task running; the scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

/// Reconcile every connected PSP account over the default 24h window.
async fn run_reconciliation(sync: &SyncService) {
    let tenants = match sync.credentials.list_tenants(Platform::Psp).await {
        Ok(tenants) => tenants,
        Err(e) => {
            error!(error = %e, "Could not list PSP accounts for reconciliation");
            return;
        }
    };

    if tenants.is_empty() {
        info!("No PSP accounts connected; reconciliation skipped");
        return;
    }

    let total = tenants.len();
    let mut failed = 0;
    let mut discrepancies = 0;

    for tenant_key in tenants {
        match sync
            .reconciliation
            .reconcile(&tenant_key, time::Duration::hours(24))
            .await
        {
            Ok(report) => {
                discrepancies += report.discrepancies.len();
                if !report.discrepancies.is_empty() {
                    info!(
                        tenant_key = %tenant_key,
                        discrepancies = report.discrepancies.len(),
                        report_path = %report.report_path,
                        "Reconciliation found discrepancies"
                    );
                }
            }
            Err(e) => {
                // A failed run reports as failed; no partial data
                error!(tenant_key = %tenant_key, error = %e, "Reconciliation run failed");
                failed += 1;
            }
        }
    }

    info!(
        total = total,
        failed = failed,
        discrepancies = discrepancies,
        "Reconciliation cycle complete"
    );
}
