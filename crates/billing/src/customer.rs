//! Stripe customer resolution
//!
//! Three-tier lookup: cache, then the accounts table, then a provider search
//! by email. Each tier that misses is repopulated from the tier below it, so
//! the chain self-heals. A user who has never subscribed resolves to `None`
//! without error; callers treat that as the free plan.

use std::sync::Arc;
use std::time::Duration;

use prepstack_shared::KvStore;
use sqlx::PgPool;
use stripe::{CreateCustomer, Customer, CustomerId, ListCustomers, ListSubscriptions, Subscription};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Cache TTL for the user → customer-id projection
const CUSTOMER_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

fn customer_cache_key(auth_user_id: &str) -> String {
    format!("customer:{}", auth_user_id)
}

/// A provider-search candidate, flattened for ranking
#[derive(Debug, Clone)]
pub struct CustomerCandidate {
    pub id: String,
    pub created: i64,
    /// Customer metadata names this user id
    pub references_user: bool,
    /// Customer holds an active/trialing/past_due subscription
    pub has_live_subscription: bool,
}

/// Rank email-search candidates: metadata reference first, then a live
/// subscription, then recency. Total order (id tiebreak) so duplicate
/// customers resolve the same way on every request.
pub fn pick_search_candidate(candidates: &[CustomerCandidate]) -> Option<&CustomerCandidate> {
    candidates.iter().max_by(|a, b| {
        a.references_user
            .cmp(&b.references_user)
            .then_with(|| a.has_live_subscription.cmp(&b.has_live_subscription))
            .then_with(|| a.created.cmp(&b.created))
            .then_with(|| b.id.cmp(&a.id))
    })
}

/// Customer service for resolving and creating Stripe customers
pub struct CustomerService {
    stripe: StripeClient,
    pool: PgPool,
    cache: Arc<dyn KvStore>,
}

impl CustomerService {
    pub fn new(stripe: StripeClient, pool: PgPool, cache: Arc<dyn KvStore>) -> Self {
        Self {
            stripe,
            pool,
            cache,
        }
    }

    /// Resolve the Stripe customer id for a user, or `None` if they have
    /// never been a customer. Never errors for a legitimate "never
    /// subscribed" user.
    pub async fn resolve_customer_id(
        &self,
        auth_user_id: &str,
        email: &str,
    ) -> BillingResult<Option<String>> {
        // Tier 1: cache
        match self.cache.get(&customer_cache_key(auth_user_id)).await {
            Ok(Some(customer_id)) => return Ok(Some(customer_id)),
            Ok(None) => {}
            Err(e) => {
                // Cache is a read optimization; a miss-with-error continues
                // down the chain.
                tracing::warn!(user_id = %auth_user_id, error = %e, "Customer cache read failed");
            }
        }

        // Tier 2: authoritative store. A read failure here degrades to the
        // provider search instead of failing the request.
        let stored: Option<(Option<String>,)> =
            match sqlx::query_as("SELECT stripe_customer_id FROM accounts WHERE auth_user_id = $1")
                .bind(auth_user_id)
                .fetch_optional(&self.pool)
                .await
            {
                Ok(stored) => stored,
                Err(e) => {
                    tracing::warn!(user_id = %auth_user_id, error = %e, "Account lookup failed, degrading to provider search");
                    None
                }
            };

        if let Some((Some(customer_id),)) = stored {
            self.populate_cache(auth_user_id, &customer_id).await;
            return Ok(Some(customer_id));
        }

        // Tier 3: search the provider by email
        let found = self.search_by_email(auth_user_id, email).await?;
        if let Some(customer_id) = &found {
            self.populate_cache(auth_user_id, customer_id).await;
            self.persist_customer_id(auth_user_id, customer_id).await;
        }

        Ok(found)
    }

    async fn populate_cache(&self, auth_user_id: &str, customer_id: &str) {
        if let Err(e) = self
            .cache
            .put(
                &customer_cache_key(auth_user_id),
                customer_id,
                Some(CUSTOMER_CACHE_TTL),
            )
            .await
        {
            tracing::warn!(user_id = %auth_user_id, error = %e, "Customer cache write failed");
        }
    }

    /// Mirror a recovered customer id into the accounts table. Best-effort:
    /// the id was found from the provider, so a failed mirror only costs the
    /// next request another search.
    async fn persist_customer_id(&self, auth_user_id: &str, customer_id: &str) {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET stripe_customer_id = $1, updated_at = NOW()
            WHERE auth_user_id = $2 AND stripe_customer_id IS NULL
            "#,
        )
        .bind(customer_id)
        .bind(auth_user_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(
                user_id = %auth_user_id,
                customer_id = %customer_id,
                error = %e,
                "Failed to persist recovered customer id"
            );
        }
    }

    /// Last-resort provider search. Multiple customers can share an email
    /// (test checkouts, support-created duplicates); preference order is
    /// metadata reference, then live subscription, then newest.
    async fn search_by_email(
        &self,
        auth_user_id: &str,
        email: &str,
    ) -> BillingResult<Option<String>> {
        let params = ListCustomers {
            email: Some(email),
            ..Default::default()
        };
        let customers = Customer::list(self.stripe.inner(), &params).await?;

        if customers.data.is_empty() {
            return Ok(None);
        }

        let mut candidates = Vec::with_capacity(customers.data.len());
        for customer in &customers.data {
            let references_user = customer
                .metadata
                .as_ref()
                .and_then(|m| m.get("auth_user_id"))
                .map(|id| id == auth_user_id)
                .unwrap_or(false);

            // Only pay for the subscription lookup when there is an actual
            // tie to break.
            let has_live_subscription = if customers.data.len() > 1 {
                self.has_live_subscription(&customer.id).await?
            } else {
                false
            };

            candidates.push(CustomerCandidate {
                id: customer.id.to_string(),
                created: customer.created.unwrap_or(0),
                references_user,
                has_live_subscription,
            });
        }

        let best = pick_search_candidate(&candidates).map(|c| c.id.clone());
        if let Some(customer_id) = &best {
            tracing::info!(
                user_id = %auth_user_id,
                customer_id = %customer_id,
                candidates = candidates.len(),
                "Resolved customer via provider email search"
            );
        }
        Ok(best)
    }

    async fn has_live_subscription(&self, customer_id: &CustomerId) -> BillingResult<bool> {
        let params = ListSubscriptions {
            customer: Some(customer_id.clone()),
            ..Default::default()
        };
        let subscriptions = Subscription::list(self.stripe.inner(), &params).await?;
        Ok(subscriptions.data.iter().any(|s| {
            matches!(
                s.status,
                stripe::SubscriptionStatus::Active
                    | stripe::SubscriptionStatus::Trialing
                    | stripe::SubscriptionStatus::PastDue
            )
        }))
    }

    /// Get the customer id for a user, creating the Stripe customer when
    /// absent. Used by checkout, where a customer must exist.
    pub async fn get_or_create_customer(
        &self,
        auth_user_id: &str,
        email: &str,
    ) -> BillingResult<String> {
        if let Some(customer_id) = self.resolve_customer_id(auth_user_id, email).await? {
            return Ok(customer_id);
        }

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("auth_user_id".to_string(), auth_user_id.to_string());
        metadata.insert("platform".to_string(), "prepstack".to_string());

        let params = CreateCustomer {
            email: Some(email),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(self.stripe.inner(), params).await?;
        let customer_id = customer.id.to_string();

        sqlx::query(
            r#"
            UPDATE accounts
            SET stripe_customer_id = $1, updated_at = NOW()
            WHERE auth_user_id = $2
            "#,
        )
        .bind(&customer_id)
        .bind(auth_user_id)
        .execute(&self.pool)
        .await?;

        self.populate_cache(auth_user_id, &customer_id).await;

        tracing::info!(
            user_id = %auth_user_id,
            customer_id = %customer_id,
            "Created Stripe customer"
        );

        Ok(customer_id)
    }

    /// Resolve the account's user id from a provider customer id. Used on
    /// the webhook path, where the provider is the source of truth flowing
    /// forward, so the cache is deliberately not consulted.
    pub async fn user_id_for_customer(&self, customer_id: &str) -> BillingResult<String> {
        let parsed = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let customer = Customer::retrieve(self.stripe.inner(), &parsed, &[]).await?;
        if let Some(user_id) = customer
            .metadata
            .as_ref()
            .and_then(|m| m.get("auth_user_id"))
        {
            return Ok(user_id.clone());
        }

        // Older customers predate the metadata convention; fall back to the
        // authoritative mapping.
        let stored: Option<(String,)> =
            sqlx::query_as("SELECT auth_user_id FROM accounts WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;

        stored
            .map(|(id,)| id)
            .ok_or_else(|| BillingError::CustomerNotFound(customer_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(
        id: &str,
        created: i64,
        references_user: bool,
        has_live: bool,
    ) -> CustomerCandidate {
        CustomerCandidate {
            id: id.to_string(),
            created,
            references_user,
            has_live_subscription: has_live,
        }
    }

    #[test]
    fn metadata_reference_beats_everything() {
        let candidates = vec![
            candidate("cus_a", 300, false, true),
            candidate("cus_b", 100, true, false),
        ];
        assert_eq!(pick_search_candidate(&candidates).unwrap().id, "cus_b");
    }

    #[test]
    fn live_subscription_beats_recency() {
        let candidates = vec![
            candidate("cus_a", 300, false, false),
            candidate("cus_b", 100, false, true),
        ];
        assert_eq!(pick_search_candidate(&candidates).unwrap().id, "cus_b");
    }

    #[test]
    fn newest_wins_among_equals() {
        let candidates = vec![
            candidate("cus_a", 100, false, false),
            candidate("cus_b", 300, false, false),
            candidate("cus_c", 200, false, false),
        ];
        assert_eq!(pick_search_candidate(&candidates).unwrap().id, "cus_b");
    }

    #[test]
    fn empty_candidates_resolve_to_none() {
        assert!(pick_search_candidate(&[]).is_none());
    }
}
