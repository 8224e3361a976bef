//! PrepStack API server

use std::sync::Arc;

use prepstack_api::{routes, AppState, Config};
use prepstack_billing::StripeClient;
use prepstack_shared::{KvStore, RedisStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prepstack_api=info,prepstack_billing=info,info".into()),
        )
        .init();

    let config = Config::from_env()?;

    let pool =
        prepstack_shared::db::create_pool(&config.database_url, config.database_max_connections)
            .await?;
    prepstack_shared::db::run_migrations(&pool).await?;

    let cache: Arc<dyn KvStore> = Arc::new(RedisStore::connect(&config.redis_url).await?);
    let stripe = StripeClient::from_env().map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let bind_address = config.bind_address.clone();
    let state = AppState::new(config, pool, cache, stripe);
    let app = routes::router(state);

    tracing::info!(bind_address = %bind_address, "Starting PrepStack API");
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
