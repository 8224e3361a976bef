//! Billing routes: checkout, upgrade, status, and the provider webhook

use axum::{
    extract::State,
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use prepstack_billing::FeatureUsage;
use prepstack_shared::Plan;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan: String,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub checkout_url: String,
}

/// POST /api/billing/checkout
pub async fn create_checkout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let plan: Plan = request
        .plan
        .parse()
        .map_err(|_| ApiError::Validation(format!("Unknown plan: {}", request.plan)))?;
    if plan == Plan::Free {
        return Err(ApiError::Validation(
            "The free plan does not require checkout".to_string(),
        ));
    }

    let email = user
        .email
        .clone()
        .ok_or_else(|| ApiError::Validation("Account has no email on file".to_string()))?;

    // Lazy account bootstrap happens on first authenticated contact.
    state
        .subscriptions
        .load_or_create_account(&user.user_id, Some(&email))
        .await?;

    let session = state
        .subscriptions
        .create_checkout(&user.user_id, &email, plan)
        .await?;

    let checkout_url = session
        .url
        .ok_or_else(|| ApiError::Upstream("checkout session has no URL".to_string()))?;

    Ok(Json(CheckoutResponse { checkout_url }))
}

#[derive(Debug, Deserialize)]
pub struct UpgradeRequest {
    pub plan: String,
}

#[derive(Debug, Serialize)]
pub struct UpgradeResponse {
    pub plan: String,
}

/// POST /api/billing/upgrade
pub async fn upgrade_plan(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<UpgradeRequest>,
) -> ApiResult<Json<UpgradeResponse>> {
    let target: Plan = request
        .plan
        .parse()
        .map_err(|_| ApiError::Validation(format!("Unknown plan: {}", request.plan)))?;

    let account = state
        .subscriptions
        .change_plan(&user.user_id, target)
        .await?;

    Ok(Json(UpgradeResponse {
        plan: account.plan.to_string(),
    }))
}

#[derive(Debug, Serialize)]
pub struct BillingStatusResponse {
    pub plan: String,
    pub effective_plan: String,
    pub subscription_status: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancel_at: Option<OffsetDateTime>,
    pub has_ever_paid: bool,
    pub usage: Vec<FeatureUsage>,
}

/// GET /api/billing/status
pub async fn billing_status(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<BillingStatusResponse>> {
    let account = state
        .subscriptions
        .load_or_create_account(&user.user_id, user.email.as_deref())
        .await?;

    let now = OffsetDateTime::now_utc();
    let effective = account.effective_plan(now);
    let usage = state.quota.usage_summary(&user.user_id, effective).await?;

    Ok(Json(BillingStatusResponse {
        plan: account.plan.to_string(),
        effective_plan: effective.to_string(),
        subscription_status: account.subscription_status.map(|s| s.to_string()),
        trial_ends_at: account.trial_ends_at,
        current_period_end: account.current_period_end,
        cancel_at: account.cancel_at,
        has_ever_paid: account.has_ever_paid,
        usage,
    }))
}

#[derive(Debug, Serialize)]
pub struct FreeGrantResponse {
    pub granted: bool,
}

/// POST /api/billing/free-grant
///
/// One extra question set, once per account. The unique index in the store
/// is what makes this at-most-once under concurrent claims; a violation
/// reads as "already claimed", not an error.
pub async fn claim_free_grant(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<FreeGrantResponse>> {
    state
        .subscriptions
        .load_or_create_account(&user.user_id, user.email.as_deref())
        .await?;

    let granted = state
        .quota
        .claim_free_grant(&user.user_id, prepstack_shared::Feature::QuestionSets)
        .await?;

    Ok(Json(FreeGrantResponse { granted }))
}

/// POST /api/billing/webhook
///
/// No bearer auth here: the provider authenticates with the signature
/// header, which is verified over the raw body before anything is parsed.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<&'static str> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Validation("Missing Stripe-Signature header".to_string()))?;

    let event = state.webhooks.verify_event(&body, signature)?;
    state.webhooks.handle_event(event).await?;

    Ok("ok")
}
