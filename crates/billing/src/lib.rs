//! PrepStack billing and entitlement engine
//!
//! Keeps a user's subscription plan consistent across the cache, the
//! authoritative store, and the payment provider, and polices per-feature
//! usage quotas under concurrent requests.

pub mod client;
pub mod customer;
pub mod error;
pub mod plans;
pub mod quota;
pub mod subscriptions;
pub mod sync;
pub mod webhooks;

pub use client::{PriceIds, StripeClient, StripeConfig};
pub use error::{BillingError, BillingResult, RateLimitReason};
pub use plans::{effective_plan, pick_best_subscription, SubscriptionSnapshot};
pub use quota::{CooldownConfig, FeatureUsage, QuotaService, UsagePermit};
pub use subscriptions::SubscriptionService;
pub use sync::SyncSweeper;
pub use webhooks::WebhookHandler;
