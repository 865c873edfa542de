//! Remit Background Worker
//!
//! Handles scheduled jobs including:
//! - Subscription consistency audit sweep with automatic repair (hourly)
//! - Health check heartbeat (every 5 minutes)
//!
//! The sweep re-reads authoritative state from the payment processor for
//! every subscription holding a processor ref and forces drifted local
//! records back into agreement.

use std::sync::Arc;
use std::time::Duration;

use remit_billing::BillingService;
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

fn sweep_limit() -> i64 {
    std::env::var("AUDIT_SWEEP_LIMIT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(500)
}

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

    info!("Starting Remit Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    // Create billing service
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // If the processor isn't configured, run in minimal mode
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            info!("Worker running without processor integration");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Consistency audit sweep (hourly)
    // Re-pulls processor state and repairs any drifted subscription.
    let audit_billing = billing.clone();
    let limit = sweep_limit();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = audit_billing.clone();
            Box::pin(async move {
                info!(limit = limit, "Running consistency audit sweep");
                match billing.auditor.run_sweep(limit).await {
                    Ok(outcome) => {
                        if outcome.drifted > 0 || outcome.errors > 0 {
                            warn!(
                                audited = outcome.audited,
                                drifted = outcome.drifted,
                                repaired = outcome.repaired,
                                errors = outcome.errors,
                                "Audit sweep found drift"
                            );
                        } else {
                            info!(audited = outcome.audited, "Audit sweep clean");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Consistency audit sweep failed");
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: Consistency audit sweep (hourly)");

    // Job 2: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Remit Worker started successfully with 2 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
