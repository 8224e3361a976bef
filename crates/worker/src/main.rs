//! PrepStack background worker
//!
//! Two timer-driven jobs:
//! - the dual-store sync sweeper, mirroring cache records flagged
//!   `needs_sync` into the authoritative store every minute
//! - pull-based reconciliation against the provider's subscription list,
//!   healing accounts whose webhook effects were missed or swallowed

use std::sync::Arc;

use prepstack_billing::{StripeClient, SubscriptionService, SyncSweeper};
use prepstack_shared::{KvStore, RedisStore};
use tokio_cron_scheduler::{Job, JobScheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prepstack_worker=info,prepstack_billing=info,info".into()),
        )
        .init();

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL not set"))?;
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

    let pool = prepstack_shared::db::create_pool(&database_url, 3).await?;
    let cache: Arc<dyn KvStore> = Arc::new(
        RedisStore::connect(&redis_url)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?,
    );
    let stripe = StripeClient::from_env().map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let sweeper = Arc::new(SyncSweeper::new(pool.clone(), cache.clone()));
    let subscriptions = Arc::new(SubscriptionService::new(stripe, pool, cache));

    let scheduler = JobScheduler::new().await?;

    // Sync sweep every minute
    let sweep = sweeper.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _lock| {
            let sweeper = sweep.clone();
            Box::pin(async move {
                if let Err(e) = sweeper.run_once().await {
                    tracing::error!(error = %e, "Sync sweep failed");
                }
            })
        })?)
        .await?;

    // Reconcile all customered accounts hourly
    let reconcile = subscriptions.clone();
    scheduler
        .add(Job::new_async("0 17 * * * *", move |_uuid, _lock| {
            let subscriptions = reconcile.clone();
            Box::pin(async move {
                if let Err(e) = subscriptions.reconcile_all().await {
                    tracing::error!(error = %e, "Reconciliation cycle failed");
                }
            })
        })?)
        .await?;

    tracing::info!("PrepStack worker started");
    scheduler.start().await?;

    // Run until terminated
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down worker");

    Ok(())
}
