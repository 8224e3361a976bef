//! Subscription lifecycle: checkout, direct plan changes, reconciliation
//!
//! Webhooks push provider state forward; this module covers the other two
//! directions: user-initiated changes going out to the provider, and
//! pull-based reconciliation reading the provider's subscription list to
//! repair whatever the webhook path missed. All three funnel plan writes
//! through the same timestamp-guarded update.

use std::sync::Arc;

use prepstack_shared::{Account, KvStore, Plan};
use sqlx::PgPool;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData, CustomerId, ListSubscriptions, Subscription,
    SubscriptionId, UpdateSubscription, UpdateSubscriptionItems,
};
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::plans::{effective_plan, pick_best_subscription, SubscriptionSnapshot};
use crate::webhooks::{apply_plan_update, PlanUpdate};

/// Trial length granted at checkout when the user picks the trial plan
const TRIAL_PERIOD_DAYS: u32 = 7;

/// Subscription service
pub struct SubscriptionService {
    stripe: StripeClient,
    pool: PgPool,
    customers: CustomerService,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool, cache: Arc<dyn KvStore>) -> Self {
        let customers = CustomerService::new(stripe.clone(), pool.clone(), cache);
        Self {
            stripe,
            pool,
            customers,
        }
    }

    /// Load the account, creating the row lazily on first sight of an
    /// authenticated user. A brand-new account is on the free plan.
    pub async fn load_or_create_account(
        &self,
        auth_user_id: &str,
        email: Option<&str>,
    ) -> BillingResult<Account> {
        sqlx::query(
            r#"
            INSERT INTO accounts (auth_user_id, email)
            VALUES ($1, $2)
            ON CONFLICT (auth_user_id) DO NOTHING
            "#,
        )
        .bind(auth_user_id)
        .bind(email)
        .execute(&self.pool)
        .await?;

        let account: Option<Account> = sqlx::query_as(
            r#"
            SELECT auth_user_id, email, plan, stripe_customer_id, stripe_subscription_id,
                   subscription_status, trial_ends_at, current_period_end, cancel_at,
                   scheduled_plan, scheduled_at, has_ever_paid, plan_updated_at
            FROM accounts
            WHERE auth_user_id = $1
            "#,
        )
        .bind(auth_user_id)
        .fetch_optional(&self.pool)
        .await?;

        account.ok_or_else(|| BillingError::AccountNotFound(auth_user_id.to_string()))
    }

    /// Create a checkout session for a new subscription.
    ///
    /// The session carries `auth_user_id` in its metadata and the trial
    /// marker in the subscription metadata, which is how the webhook path
    /// later tells a trial apart from a paid essential subscription.
    pub async fn create_checkout(
        &self,
        auth_user_id: &str,
        email: &str,
        plan: Plan,
    ) -> BillingResult<CheckoutSession> {
        let price_id = self
            .stripe
            .config()
            .price_for_plan(plan)
            .ok_or_else(|| BillingError::InvalidPlan(plan.to_string()))?
            .to_string();

        let customer_id = self
            .customers
            .get_or_create_customer(auth_user_id, email)
            .await?;
        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let base_url = &self.stripe.config().app_base_url;
        let success_url = format!(
            "{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}",
            base_url
        );
        let cancel_url = format!("{}/billing/cancel", base_url);

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("auth_user_id".to_string(), auth_user_id.to_string());
        metadata.insert("plan".to_string(), plan.to_string());

        let mut subscription_metadata = std::collections::HashMap::new();
        subscription_metadata.insert("auth_user_id".to_string(), auth_user_id.to_string());
        if plan == Plan::Trial {
            subscription_metadata.insert("original_plan".to_string(), "trial".to_string());
        }

        let subscription_data = CreateCheckoutSessionSubscriptionData {
            metadata: Some(subscription_metadata),
            trial_period_days: (plan == Plan::Trial).then_some(TRIAL_PERIOD_DAYS),
            ..Default::default()
        };

        let line_items = vec![CreateCheckoutSessionLineItems {
            price: Some(price_id),
            quantity: Some(1),
            ..Default::default()
        }];

        let params = CreateCheckoutSession {
            customer: Some(customer_id),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(line_items),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            metadata: Some(metadata),
            subscription_data: Some(subscription_data),
            allow_promotion_codes: Some(true),
            ..Default::default()
        };

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            user_id = %auth_user_id,
            session_id = %session.id,
            plan = %plan,
            "Created checkout session"
        );

        Ok(session)
    }

    /// Change an existing subscription to a higher plan in place.
    ///
    /// Already on the target plan and downgrade attempts are distinct
    /// conflicts so a client can react differently to each. Downgrades go
    /// through support for now rather than silently shrinking a paid period.
    pub async fn change_plan(&self, auth_user_id: &str, target: Plan) -> BillingResult<Account> {
        let account = self.load_or_create_account(auth_user_id, None).await?;
        let now = OffsetDateTime::now_utc();
        let current = account.effective_plan(now);

        if target == current {
            return Err(BillingError::AlreadyOnPlan(target.to_string()));
        }
        if !target.is_paid() {
            return Err(BillingError::InvalidPlan(target.to_string()));
        }
        if target.rank() < current.rank() {
            return Err(BillingError::DowngradeBlocked {
                from: current.to_string(),
                to: target.to_string(),
            });
        }

        let subscription_id = account.stripe_subscription_id.clone().ok_or_else(|| {
            BillingError::InvalidInput(
                "No active subscription to upgrade; use checkout".to_string(),
            )
        })?;

        let price_id = self
            .stripe
            .config()
            .price_for_plan(target)
            .ok_or_else(|| BillingError::InvalidPlan(target.to_string()))?
            .to_string();

        let sub_id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        let current_sub = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;
        let item_id = current_sub
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.clone()))?;

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(price_id),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let updated = Subscription::update(self.stripe.inner(), &sub_id, params).await?;

        // Mirror the new state immediately; the webhook for this update will
        // arrive later and no-op against the same timestamp guard.
        let snapshot = SubscriptionSnapshot::from_stripe(&updated);
        let plan = effective_plan(&snapshot, self.stripe.config());
        let update = PlanUpdate {
            plan,
            subscription_id: Some(snapshot.id.clone()),
            subscription_status: Some(snapshot.status.as_str().to_string()),
            trial_ends_at: snapshot
                .trial_end
                .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok()),
            current_period_end: OffsetDateTime::from_unix_timestamp(snapshot.current_period_end)
                .ok(),
            cancel_at: snapshot
                .cancel_at
                .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok()),
            mark_paid: true,
        };
        apply_plan_update(&self.pool, auth_user_id, &update, now).await?;

        tracing::info!(
            user_id = %auth_user_id,
            subscription_id = %snapshot.id,
            from = %current,
            to = %plan,
            "Upgraded subscription in place"
        );

        self.load_or_create_account(auth_user_id, None).await
    }

    /// Pull-based reconciliation: read the provider's subscription list,
    /// pick the best one, and apply the plan it confers. Heals accounts left
    /// inconsistent by swallowed webhook effects or missed deliveries.
    pub async fn reconcile_account(&self, auth_user_id: &str) -> BillingResult<Plan> {
        let account = self.load_or_create_account(auth_user_id, None).await?;

        let Some(customer_id) = account.stripe_customer_id.clone() else {
            // Never subscribed; nothing to reconcile against.
            return Ok(account.plan);
        };

        let parsed = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let params = ListSubscriptions {
            customer: Some(parsed),
            ..Default::default()
        };
        let subscriptions = Subscription::list(self.stripe.inner(), &params).await?;
        let snapshots: Vec<SubscriptionSnapshot> = subscriptions
            .data
            .iter()
            .map(SubscriptionSnapshot::from_stripe)
            .collect();

        let now = OffsetDateTime::now_utc();
        let update = match pick_best_subscription(&snapshots, self.stripe.config()) {
            Some(best) => {
                let plan = effective_plan(best, self.stripe.config());
                PlanUpdate {
                    plan,
                    subscription_id: Some(best.id.clone()),
                    subscription_status: Some(best.status.as_str().to_string()),
                    trial_ends_at: best
                        .trial_end
                        .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok()),
                    current_period_end: OffsetDateTime::from_unix_timestamp(
                        best.current_period_end,
                    )
                    .ok(),
                    cancel_at: best
                        .cancel_at
                        .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok()),
                    mark_paid: best.status == prepstack_shared::SubscriptionStatus::Active,
                }
            }
            None => PlanUpdate {
                plan: Plan::Free,
                subscription_id: None,
                subscription_status: None,
                trial_ends_at: None,
                current_period_end: None,
                cancel_at: None,
                mark_paid: false,
            },
        };

        if update.plan != account.plan {
            tracing::info!(
                user_id = %auth_user_id,
                stored = %account.plan,
                resolved = %update.plan,
                "Reconciliation repairing plan drift"
            );
        }

        apply_plan_update(&self.pool, auth_user_id, &update, now).await?;
        Ok(update.plan)
    }

    /// Reconcile every account that has a provider customer. One account's
    /// failure never aborts the batch.
    pub async fn reconcile_all(&self) -> BillingResult<usize> {
        let user_ids: Vec<(String,)> = sqlx::query_as(
            "SELECT auth_user_id FROM accounts WHERE stripe_customer_id IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        let total = user_ids.len();
        for (auth_user_id,) in user_ids {
            if let Err(e) = self.reconcile_account(&auth_user_id).await {
                tracing::error!(user_id = %auth_user_id, error = %e, "Reconciliation failed");
            }
        }

        tracing::info!(accounts = total, "Completed reconciliation cycle");
        Ok(total)
    }

    /// Customer resolution chain, exposed for the HTTP layer.
    pub fn customers(&self) -> &CustomerService {
        &self.customers
    }
}
