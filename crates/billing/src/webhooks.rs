//! Stripe webhook handling
//!
//! Verifies event authenticity, deduplicates replays, and applies plan state
//! in business-timestamp order. Delivery order is not trusted anywhere in
//! this module: the provider retries and reorders, so every write is guarded
//! on the event's creation timestamp, and every event id is only applied
//! once.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use prepstack_shared::{KvStore, Plan};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Event, EventObject, EventType, Subscription};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::plans::{effective_plan, SubscriptionSnapshot};

type HmacSha256 = Hmac<Sha256>;

/// Reject events whose creation timestamp is further than this from now
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Dedup markers outlive the provider's retry window
const EVENT_MARKER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

fn event_marker_key(event_id: &str) -> String {
    format!("webhook:event:{}", event_id)
}

/// Parsed `Stripe-Signature` header: `t=<unix>,v1=<hex>,...`
#[derive(Debug, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    pub v1: String,
}

pub fn parse_signature_header(header: &str) -> Option<SignatureHeader> {
    let mut timestamp: Option<i64> = None;
    let mut v1: Option<String> = None;

    for part in header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0].trim() {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1 = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    Some(SignatureHeader {
        timestamp: timestamp?,
        v1: v1?,
    })
}

/// Verify the HMAC signature over `timestamp.rawBody`.
///
/// `now` is injected so the staleness window is testable. The comparison is
/// constant-time; a plain `==` on hex strings leaks a timing oracle on the
/// signing secret.
pub fn verify_signature(
    payload: &str,
    header: &str,
    webhook_secret: &str,
    now: i64,
) -> BillingResult<()> {
    let parsed = parse_signature_header(header).ok_or_else(|| {
        tracing::error!("Malformed webhook signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if (now - parsed.timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::error!(
            timestamp = parsed.timestamp,
            now = now,
            "Webhook timestamp outside tolerance window"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{}.{}", parsed.timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = mac.finalize().into_bytes();

    let received = hex::decode(&parsed.v1).map_err(|_| BillingError::WebhookSignatureInvalid)?;

    if computed.ct_eq(received.as_slice()).into() {
        Ok(())
    } else {
        tracing::error!("Webhook signature mismatch");
        Err(BillingError::WebhookSignatureInvalid)
    }
}

/// Fields written to the account alongside a plan change, all derived from
/// the same subscription snapshot so the row never mixes two events.
#[derive(Debug, Clone)]
pub struct PlanUpdate {
    pub plan: Plan,
    pub subscription_id: Option<String>,
    pub subscription_status: Option<String>,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at: Option<OffsetDateTime>,
    pub mark_paid: bool,
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    cache: Arc<dyn KvStore>,
    customers: CustomerService,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool, cache: Arc<dyn KvStore>) -> Self {
        let customers = CustomerService::new(stripe.clone(), pool.clone(), cache.clone());
        Self {
            stripe,
            pool,
            cache,
            customers,
        }
    }

    /// Verify and parse a Stripe webhook event
    ///
    /// Uses manual signature verification to work around async-stripe version
    /// incompatibility with newer Stripe API versions.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let secret = &self.stripe.config().webhook_secret;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, secret, now)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// The dedup marker is claimed before any effect runs; a replayed event
    /// id acknowledges without reprocessing. Effect errors after the marker
    /// are logged and swallowed; the provider will not retry forever, and a
    /// dangling inconsistency is healed by pull-based reconciliation against
    /// the provider's subscription list, not by webhook retries.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        let claimed = self
            .cache
            .put_if_absent(&event_marker_key(&event_id), "1", EVENT_MARKER_TTL)
            .await?;

        if !claimed {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Duplicate webhook event, acknowledging without reprocessing"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            "Processing Stripe webhook event"
        );

        if let Err(e) = self.process_event_internal(&event).await {
            tracing::error!(
                event_id = %event_id,
                event_type = %event_type,
                error = %e,
                "Webhook effect application failed; reconciliation will repair the account"
            );
        }

        Ok(())
    }

    async fn process_event_internal(&self, event: &Event) -> BillingResult<()> {
        let ts_event = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        match event.type_ {
            EventType::CheckoutSessionCompleted => {
                self.handle_checkout_completed(event, ts_event).await?;
            }
            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                self.handle_subscription_changed(event, ts_event).await?;
            }
            EventType::CustomerSubscriptionDeleted => {
                self.handle_subscription_deleted(event, ts_event).await?;
            }
            _ => {
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
            }
        }

        Ok(())
    }

    async fn handle_checkout_completed(
        &self,
        event: &Event,
        ts_event: OffsetDateTime,
    ) -> BillingResult<()> {
        let session = match &event.data.object {
            EventObject::CheckoutSession(session) => session,
            _ => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Expected CheckoutSession".to_string(),
                ))
            }
        };

        let subscription_id = match &session.subscription {
            Some(sub) => sub.id(),
            None => {
                tracing::info!(session_id = %session.id, "Checkout session has no subscription");
                return Ok(());
            }
        };

        let parsed_sub_id = subscription_id.as_str().parse().map_err(|e| {
            BillingError::SubscriptionNotFound(format!("{}: {}", subscription_id, e))
        })?;
        let subscription =
            Subscription::retrieve(self.stripe.inner(), &parsed_sub_id, &[]).await?;

        let auth_user_id = self.resolve_user(&subscription).await?;
        let snapshot = SubscriptionSnapshot::from_stripe(&subscription);
        let plan = effective_plan(&snapshot, self.stripe.config());

        let mut update = plan_update_from_snapshot(plan, &snapshot);
        // Completing checkout means a payment method was captured.
        update.mark_paid = true;

        self.apply_plan_update(&auth_user_id, &update, ts_event)
            .await?;

        tracing::info!(
            user_id = %auth_user_id,
            subscription_id = %snapshot.id,
            plan = %plan,
            "Checkout completed"
        );

        Ok(())
    }

    async fn handle_subscription_changed(
        &self,
        event: &Event,
        ts_event: OffsetDateTime,
    ) -> BillingResult<()> {
        let subscription = self.extract_subscription(event)?;
        let auth_user_id = self.resolve_user(&subscription).await?;

        let snapshot = SubscriptionSnapshot::from_stripe(&subscription);
        let plan = effective_plan(&snapshot, self.stripe.config());

        let mut update = plan_update_from_snapshot(plan, &snapshot);
        update.mark_paid = snapshot.status == prepstack_shared::SubscriptionStatus::Active;

        self.apply_plan_update(&auth_user_id, &update, ts_event)
            .await?;

        tracing::info!(
            user_id = %auth_user_id,
            subscription_id = %snapshot.id,
            status = %snapshot.status,
            plan = %plan,
            "Subscription state applied"
        );

        Ok(())
    }

    async fn handle_subscription_deleted(
        &self,
        event: &Event,
        ts_event: OffsetDateTime,
    ) -> BillingResult<()> {
        let subscription = self.extract_subscription(event)?;
        let auth_user_id = self.resolve_user(&subscription).await?;

        let update = PlanUpdate {
            plan: Plan::Free,
            subscription_id: None,
            subscription_status: Some("canceled".to_string()),
            trial_ends_at: None,
            current_period_end: None,
            cancel_at: None,
            mark_paid: false,
        };

        self.apply_plan_update(&auth_user_id, &update, ts_event)
            .await?;

        tracing::info!(
            user_id = %auth_user_id,
            subscription_id = %subscription.id,
            "Subscription deleted, account downgraded to free"
        );

        Ok(())
    }

    fn extract_subscription(&self, event: &Event) -> BillingResult<Subscription> {
        match &event.data.object {
            EventObject::Subscription(subscription) => Ok(subscription.clone()),
            _ => Err(BillingError::WebhookEventNotSupported(
                "Expected Subscription".to_string(),
            )),
        }
    }

    /// Resolve the user id for a subscription's customer. Goes through the
    /// provider (customer metadata) with a store fallback; the webhook path
    /// is the source of truth propagating forward, so the cache projection is
    /// never consulted here.
    async fn resolve_user(&self, subscription: &Subscription) -> BillingResult<String> {
        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };
        self.customers.user_id_for_customer(&customer_id).await
    }

    async fn apply_plan_update(
        &self,
        auth_user_id: &str,
        update: &PlanUpdate,
        ts_event: OffsetDateTime,
    ) -> BillingResult<()> {
        apply_plan_update(&self.pool, auth_user_id, update, ts_event).await
    }
}

/// Timestamp-guarded plan write: last-write-wins by business time.
///
/// The row only moves if this event is at least as new as the last applied
/// one, so a delayed `deleted` can never clobber a newer `updated`. Accounts
/// that have not been lazily created yet are inserted on the spot. Shared by
/// the webhook path, direct plan changes, and pull-based reconciliation so
/// all three respect the same ordering guard.
pub async fn apply_plan_update(
    pool: &PgPool,
    auth_user_id: &str,
    update: &PlanUpdate,
    ts_event: OffsetDateTime,
) -> BillingResult<()> {
    let result = sqlx::query(
            r#"
            INSERT INTO accounts (
                auth_user_id, plan, stripe_subscription_id, subscription_status,
                trial_ends_at, current_period_end, cancel_at, has_ever_paid,
                plan_updated_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            ON CONFLICT (auth_user_id) DO UPDATE SET
                plan = EXCLUDED.plan,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                subscription_status = EXCLUDED.subscription_status,
                trial_ends_at = EXCLUDED.trial_ends_at,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at = EXCLUDED.cancel_at,
                has_ever_paid = accounts.has_ever_paid OR EXCLUDED.has_ever_paid,
                plan_updated_at = EXCLUDED.plan_updated_at,
                updated_at = NOW()
            WHERE accounts.plan_updated_at IS NULL
               OR accounts.plan_updated_at <= EXCLUDED.plan_updated_at
            "#,
        )
        .bind(auth_user_id)
        .bind(update.plan.as_str())
        .bind(&update.subscription_id)
        .bind(&update.subscription_status)
        .bind(update.trial_ends_at)
        .bind(update.current_period_end)
        .bind(update.cancel_at)
        .bind(update.mark_paid)
        .bind(ts_event)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        tracing::info!(
            user_id = %auth_user_id,
            ts_event = %ts_event,
            plan = %update.plan,
            "Stale plan update skipped; account already reflects a newer event"
        );
    }

    Ok(())
}

fn ts(unix: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(unix).ok()
}

fn plan_update_from_snapshot(plan: Plan, snapshot: &SubscriptionSnapshot) -> PlanUpdate {
    PlanUpdate {
        plan,
        subscription_id: Some(snapshot.id.clone()),
        subscription_status: Some(snapshot.status.as_str().to_string()),
        trial_ends_at: snapshot.trial_end.and_then(ts),
        current_period_end: ts(snapshot.current_period_end),
        cancel_at: snapshot.cancel_at.and_then(ts),
        mark_paid: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn parses_signature_header() {
        let parsed = parse_signature_header("t=1700000000,v1=abc123,v0=def").unwrap();
        assert_eq!(parsed.timestamp, 1_700_000_000);
        assert_eq!(parsed.v1, "abc123");

        assert!(parse_signature_header("v1=abc").is_none());
        assert!(parse_signature_header("t=123").is_none());
        assert!(parse_signature_header("").is_none());
    }

    #[test]
    fn accepts_valid_signature() {
        let payload = r#"{"id":"evt_1","type":"customer.subscription.updated"}"#;
        let secret = "whsec_testsecret";
        let now = 1_700_000_000;
        let header = sign(payload, secret, now);

        assert!(verify_signature(payload, &header, secret, now).is_ok());
    }

    #[test]
    fn rejects_tampered_payload() {
        let payload = r#"{"id":"evt_1"}"#;
        let secret = "whsec_testsecret";
        let now = 1_700_000_000;
        let header = sign(payload, secret, now);

        let result = verify_signature(r#"{"id":"evt_2"}"#, &header, secret, now);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn rejects_wrong_secret() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = sign(payload, "whsec_real", now);

        let result = verify_signature(payload, &header, "whsec_other", now);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    mod db {
        //! Ordering-guard behavior against the authoritative store.
        use super::*;
        use prepstack_shared::db::create_pool;

        async fn plan_of(pool: &sqlx::PgPool, user: &str) -> String {
            let (plan,): (String,) =
                sqlx::query_as("SELECT plan FROM accounts WHERE auth_user_id = $1")
                    .bind(user)
                    .fetch_one(pool)
                    .await
                    .unwrap();
            plan
        }

        fn update(plan: Plan, sub_id: &str) -> PlanUpdate {
            PlanUpdate {
                plan,
                subscription_id: Some(sub_id.to_string()),
                subscription_status: Some("active".to_string()),
                trial_ends_at: None,
                current_period_end: None,
                cancel_at: None,
                mark_paid: plan.is_paid(),
            }
        }

        #[tokio::test]
        #[ignore] // Requires database
        async fn newer_event_wins_regardless_of_arrival_order() {
            let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
            let pool = create_pool(&url, 3).await.expect("pool");
            let user = format!("test_{}", uuid::Uuid::new_v4());

            let t100 = OffsetDateTime::from_unix_timestamp(100).unwrap();
            let t200 = OffsetDateTime::from_unix_timestamp(200).unwrap();

            // Deleted (ts=100) arrives AFTER updated-to-pro (ts=200):
            // the delayed delete must not clobber the newer state.
            apply_plan_update(&pool, &user, &update(Plan::Pro, "sub_1"), t200)
                .await
                .unwrap();
            apply_plan_update(&pool, &user, &update(Plan::Free, "sub_1"), t100)
                .await
                .unwrap();
            assert_eq!(plan_of(&pool, &user).await, "pro");

            // Same pair in business order lands on the same final state.
            let user2 = format!("test_{}", uuid::Uuid::new_v4());
            apply_plan_update(&pool, &user2, &update(Plan::Free, "sub_1"), t100)
                .await
                .unwrap();
            apply_plan_update(&pool, &user2, &update(Plan::Pro, "sub_1"), t200)
                .await
                .unwrap();
            assert_eq!(plan_of(&pool, &user2).await, "pro");
        }

        #[tokio::test]
        #[ignore] // Requires database
        async fn applying_the_same_update_twice_is_idempotent() {
            let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
            let pool = create_pool(&url, 3).await.expect("pool");
            let user = format!("test_{}", uuid::Uuid::new_v4());

            let ts = OffsetDateTime::from_unix_timestamp(500).unwrap();
            let change = update(Plan::Premium, "sub_9");

            apply_plan_update(&pool, &user, &change, ts).await.unwrap();
            apply_plan_update(&pool, &user, &change, ts).await.unwrap();

            assert_eq!(plan_of(&pool, &user).await, "premium");
        }
    }

    #[test]
    fn rejects_stale_and_future_timestamps() {
        let payload = r#"{"id":"evt_1"}"#;
        let secret = "whsec_testsecret";
        let signed_at = 1_700_000_000;
        let header = sign(payload, secret, signed_at);

        // 301 seconds later: outside the replay window
        let stale = verify_signature(payload, &header, secret, signed_at + 301);
        assert!(matches!(stale, Err(BillingError::WebhookSignatureInvalid)));

        // Clock skew in the other direction is rejected the same way
        let future = verify_signature(payload, &header, secret, signed_at - 301);
        assert!(matches!(future, Err(BillingError::WebhookSignatureInvalid)));

        // Within the window is fine
        assert!(verify_signature(payload, &header, secret, signed_at + 299).is_ok());
    }
}
