//! API error types and handling
//!
//! One place maps the domain taxonomy onto HTTP: auth → 401, validation →
//! 400, entitlement → 403, rate limits → 429 with enough structure for a
//! client to back off intelligently, conflicts → 409 distinguishing
//! "already there" from "blocked", upstream failures → 502, and an
//! unreachable store → 503.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use prepstack_billing::{BillingError, RateLimitReason};
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Authentication required")]
    Unauthorized,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,

    // Entitlement (plan does not cover the feature; distinct from quota)
    #[error("Plan does not cover this feature: {0}")]
    NotEntitled(String),

    // Rate limiting: cooldown, concurrent lease, or quota
    #[error("Too many requests")]
    RateLimited {
        reason: &'static str,
        used: i64,
        limit: i64,
        retry_after_seconds: Option<u64>,
    },

    // Conflicts. `blocked` distinguishes "can't do that" from "nothing to do"
    #[error("Conflict: {message}")]
    Conflict { message: String, blocked: bool },

    // Upstream provider failure (payment, identity, generation)
    #[error("Upstream provider error: {0}")]
    Upstream(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Service unavailable")]
    StoreUnavailable,
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::RateLimited {
                reason,
                used,
                limit,
                retry_after_seconds,
            } => {
                let body = Json(json!({
                    "error": {
                        "code": "RATE_LIMITED",
                        "reason": reason,
                        "used": used,
                        "limit": limit,
                        "retry_after_seconds": retry_after_seconds,
                    }
                }));
                (StatusCode::TOO_MANY_REQUESTS, body).into_response()
            }
            ApiError::Conflict { message, blocked } => {
                let body = Json(json!({
                    "error": {
                        "code": if blocked { "CONFLICT_BLOCKED" } else { "CONFLICT_ALREADY" },
                        "message": message,
                        "blocked": blocked,
                    }
                }));
                (StatusCode::CONFLICT, body).into_response()
            }
            other => {
                let (status, code, message) = match &other {
                    ApiError::InvalidToken => {
                        (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", other.to_string())
                    }
                    ApiError::Unauthorized => {
                        (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", other.to_string())
                    }
                    ApiError::Validation(msg) => {
                        (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                    }
                    ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", other.to_string()),
                    ApiError::NotEntitled(msg) => {
                        (StatusCode::FORBIDDEN, "NOT_ENTITLED", msg.clone())
                    }
                    ApiError::Upstream(_) => (
                        StatusCode::BAD_GATEWAY,
                        "UPSTREAM_ERROR",
                        "Upstream provider error".to_string(),
                    ),
                    ApiError::Database(_) => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "DATABASE_ERROR",
                        "Database error".to_string(),
                    ),
                    ApiError::StoreUnavailable => (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "STORE_UNAVAILABLE",
                        other.to_string(),
                    ),
                    ApiError::Internal => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        other.to_string(),
                    ),
                    // Already handled by the outer match arms
                    ApiError::RateLimited { .. } | ApiError::Conflict { .. } => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        other.to_string(),
                    ),
                };

                let body = Json(json!({
                    "error": {
                        "code": code,
                        "message": message,
                    }
                }));
                (status, body).into_response()
            }
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::RateLimited {
                reason,
                used,
                limit,
                retry_after_seconds,
                ..
            } => ApiError::RateLimited {
                reason: match reason {
                    RateLimitReason::Cooldown => "cooldown",
                    RateLimitReason::Concurrent => "concurrent",
                    RateLimitReason::Quota => "quota",
                },
                used,
                limit,
                retry_after_seconds,
            },
            BillingError::NotEntitled { plan, feature } => {
                ApiError::NotEntitled(format!("Plan {} does not cover {}", plan, feature))
            }
            BillingError::AlreadyOnPlan(plan) => ApiError::Conflict {
                message: format!("Already on plan {}", plan),
                blocked: false,
            },
            BillingError::DowngradeBlocked { from, to } => ApiError::Conflict {
                message: format!("Downgrade from {} to {} is not allowed here", from, to),
                blocked: true,
            },
            BillingError::WebhookSignatureInvalid => {
                ApiError::Validation("Invalid webhook signature".to_string())
            }
            BillingError::InvalidInput(msg) | BillingError::InvalidPlan(msg) => {
                ApiError::Validation(msg)
            }
            BillingError::NotFound(_)
            | BillingError::AccountNotFound(_)
            | BillingError::CustomerNotFound(_)
            | BillingError::SubscriptionNotFound(_) => ApiError::NotFound,
            BillingError::StripeApi(msg) => {
                tracing::error!(error = %msg, "Stripe API error");
                ApiError::Upstream(msg)
            }
            BillingError::StoreUnavailable(msg) => {
                tracing::error!(error = %msg, "Authoritative store unavailable");
                ApiError::StoreUnavailable
            }
            BillingError::Cache(msg) => {
                // The cache carries locks and cooldowns; without it the
                // metered path cannot run safely.
                tracing::error!(error = %msg, "Cache unavailable");
                ApiError::StoreUnavailable
            }
            BillingError::Database(msg) | BillingError::SchemaMismatch(msg) => {
                tracing::error!(error = %msg, "Database error");
                ApiError::Database(msg)
            }
            BillingError::WebhookEventNotSupported(_)
            | BillingError::Config(_)
            | BillingError::Internal(_) => ApiError::Internal,
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                ApiError::StoreUnavailable
            }
            _ => ApiError::Database(err.to_string()),
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn taxonomy_maps_to_documented_status_codes() {
        assert_eq!(status_of(ApiError::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_of(ApiError::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(ApiError::NotEntitled("free".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(status_of(ApiError::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(ApiError::RateLimited {
                reason: "quota",
                used: 10,
                limit: 10,
                retry_after_seconds: None
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(ApiError::Conflict {
                message: "already".into(),
                blocked: false
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(ApiError::Upstream("stripe".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(ApiError::StoreUnavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn billing_rate_limit_carries_structure_through() {
        let err: ApiError = BillingError::RateLimited {
            reason: RateLimitReason::Quota,
            feature: prepstack_shared::Feature::QuestionSets,
            used: 9,
            limit: 10,
            retry_after_seconds: None,
        }
        .into();

        match err {
            ApiError::RateLimited {
                reason,
                used,
                limit,
                ..
            } => {
                assert_eq!(reason, "quota");
                assert_eq!(used, 9);
                assert_eq!(limit, 10);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn conflicts_distinguish_already_from_blocked() {
        let already: ApiError = BillingError::AlreadyOnPlan("pro".into()).into();
        let blocked: ApiError = BillingError::DowngradeBlocked {
            from: "pro".into(),
            to: "essential".into(),
        }
        .into();

        assert!(matches!(already, ApiError::Conflict { blocked: false, .. }));
        assert!(matches!(blocked, ApiError::Conflict { blocked: true, .. }));
    }
}
