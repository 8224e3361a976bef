//! Billing error types

use prepstack_shared::Feature;
use thiserror::Error;

/// Why a metered request was rejected before execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    /// Mode-specific cooldown window has not elapsed
    Cooldown,
    /// Another request holds the lease for this key
    Concurrent,
    /// Period budget exhausted
    Quota,
}

impl RateLimitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitReason::Cooldown => "cooldown",
            RateLimitReason::Concurrent => "concurrent",
            RateLimitReason::Quota => "quota",
        }
    }
}

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook event type not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Rate limited ({reason:?}) for {feature}")]
    RateLimited {
        reason: RateLimitReason,
        feature: Feature,
        used: i64,
        limit: i64,
        retry_after_seconds: Option<u64>,
    },

    #[error("Plan {plan} does not cover {feature}")]
    NotEntitled { plan: String, feature: Feature },

    #[error("Already on plan {0}")]
    AlreadyOnPlan(String),

    #[error("Downgrade from {from} to {to} is not allowed here")]
    DowngradeBlocked { from: String, to: String },

    #[error("Database error: {0}")]
    Database(String),

    /// The authoritative store is unreachable, as opposed to rejecting a
    /// statement. Surfaces as 503 with degraded cache-only reads where safe.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Stored data disagrees with the expected schema. Kept distinct from
    /// NotFound so degraded reads are never mistaken for data corruption.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::ColumnNotFound(col) => {
                BillingError::SchemaMismatch(format!("missing column: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                BillingError::SchemaMismatch(format!("column {}: {}", index, source))
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                BillingError::StoreUnavailable(err.to_string())
            }
            _ => BillingError::Database(err.to_string()),
        }
    }
}

impl From<prepstack_shared::CacheError> for BillingError {
    fn from(err: prepstack_shared::CacheError) -> Self {
        BillingError::Cache(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

/// True when the database error is a unique-constraint violation. The unique
/// index is the real at-most-once guarantee; callers map this to
/// "already exists" instead of retrying the write.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}
