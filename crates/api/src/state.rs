//! Shared application state

use std::sync::Arc;

use prepstack_billing::{QuotaService, StripeClient, SubscriptionService, SyncSweeper, WebhookHandler};
use prepstack_shared::KvStore;
use sqlx::PgPool;

use crate::auth::IdentityVerifier;
use crate::config::Config;
use crate::generation::GenerationClient;

/// Application state shared across request handlers. Exactly one handle per
/// external store, resolved once at startup; nothing here caches account
/// state across requests.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub cache: Arc<dyn KvStore>,
    pub identity: IdentityVerifier,
    pub generation: GenerationClient,
    pub subscriptions: Arc<SubscriptionService>,
    pub quota: Arc<QuotaService>,
    pub webhooks: Arc<WebhookHandler>,
    pub sweeper: Arc<SyncSweeper>,
}

impl AppState {
    pub fn new(
        config: Config,
        pool: PgPool,
        cache: Arc<dyn KvStore>,
        stripe: StripeClient,
    ) -> Self {
        let http = reqwest::Client::new();

        let identity = IdentityVerifier::new(
            http.clone(),
            config.identity_base_url.clone(),
            config.identity_api_key.clone(),
        );
        let generation = GenerationClient::new(
            http,
            config.generation_base_url.clone(),
            config.generation_timeout_ms,
        );

        let subscriptions = Arc::new(SubscriptionService::new(
            stripe.clone(),
            pool.clone(),
            cache.clone(),
        ));
        let quota = Arc::new(QuotaService::new(pool.clone(), cache.clone()));
        let webhooks = Arc::new(WebhookHandler::new(stripe, pool.clone(), cache.clone()));
        let sweeper = Arc::new(SyncSweeper::new(pool.clone(), cache.clone()));

        Self {
            config: Arc::new(config),
            pool,
            cache,
            identity,
            generation,
            subscriptions,
            quota,
            webhooks,
            sweeper,
        }
    }
}
