//! Stripe client configuration

use prepstack_shared::Plan;
use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs for each plan tier
    pub price_ids: PriceIds,
    /// Base URL for success/cancel redirects
    pub app_base_url: String,
}

/// Stripe price IDs per paid tier. Each tier carries an ordered list: the
/// primary price first, then any legacy prices still attached to older
/// subscriptions. `trial` shares the essential price and is distinguished by
/// subscription metadata, never by price.
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub essential: Vec<String>,
    pub pro: Vec<String>,
    pub premium: Vec<String>,
}

/// Collect a primary price env var plus an optional comma-separated legacy
/// list into one ordered lookup list.
fn price_list(primary_var: &'static str, legacy_var: &'static str) -> BillingResult<Vec<String>> {
    let primary = std::env::var(primary_var)
        .map_err(|_| BillingError::Config(format!("{} not set", primary_var)))?;

    let mut ids = vec![primary];
    if let Ok(legacy) = std::env::var(legacy_var) {
        ids.extend(
            legacy
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
        );
    }
    Ok(ids)
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            price_ids: PriceIds {
                essential: price_list("STRIPE_PRICE_ESSENTIAL", "STRIPE_PRICE_ESSENTIAL_LEGACY")?,
                pro: price_list("STRIPE_PRICE_PRO", "STRIPE_PRICE_PRO_LEGACY")?,
                premium: price_list("STRIPE_PRICE_PREMIUM", "STRIPE_PRICE_PREMIUM_LEGACY")?,
            },
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }

    /// Map a price ID to its plan by checking each tier's ordered price list.
    ///
    /// An unrecognized price resolves to `essential` only when the caller
    /// explicitly opts in via `default_to_essential`; otherwise `None`, so
    /// money-relevant paths can fail closed instead of guessing.
    pub fn plan_for_price(&self, price_id: &str, default_to_essential: bool) -> Option<Plan> {
        if self.price_ids.essential.iter().any(|p| p == price_id) {
            Some(Plan::Essential)
        } else if self.price_ids.pro.iter().any(|p| p == price_id) {
            Some(Plan::Pro)
        } else if self.price_ids.premium.iter().any(|p| p == price_id) {
            Some(Plan::Premium)
        } else if default_to_essential {
            Some(Plan::Essential)
        } else {
            None
        }
    }

    /// Primary price ID for a plan. Trial maps to the essential price; free
    /// has no price.
    pub fn price_for_plan(&self, plan: Plan) -> Option<&str> {
        let list = match plan {
            Plan::Essential | Plan::Trial => &self.price_ids.essential,
            Plan::Pro => &self.price_ids.pro,
            Plan::Premium => &self.price_ids.premium,
            Plan::Free => return None,
        };
        list.first().map(String::as_str)
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test".to_string(),
            webhook_secret: "whsec_test".to_string(),
            price_ids: PriceIds {
                essential: vec!["price_ess".to_string(), "price_ess_2023".to_string()],
                pro: vec!["price_pro".to_string()],
                premium: vec!["price_prem".to_string()],
            },
            app_base_url: "http://localhost:3000".to_string(),
        }
    }

    #[test]
    fn price_to_plan_checks_legacy_ids() {
        let config = test_config();
        assert_eq!(
            config.plan_for_price("price_ess", false),
            Some(Plan::Essential)
        );
        assert_eq!(
            config.plan_for_price("price_ess_2023", false),
            Some(Plan::Essential)
        );
        assert_eq!(config.plan_for_price("price_pro", false), Some(Plan::Pro));
        assert_eq!(
            config.plan_for_price("price_prem", false),
            Some(Plan::Premium)
        );
    }

    #[test]
    fn unknown_price_fails_closed_unless_opted_in() {
        let config = test_config();
        assert_eq!(config.plan_for_price("price_mystery", false), None);
        assert_eq!(
            config.plan_for_price("price_mystery", true),
            Some(Plan::Essential)
        );
    }

    #[test]
    fn plan_to_price_round_trips_paid_tiers() {
        let config = test_config();
        for plan in [Plan::Essential, Plan::Pro, Plan::Premium] {
            let price = config.price_for_plan(plan).unwrap();
            assert_eq!(config.plan_for_price(price, false), Some(plan));
        }
    }

    #[test]
    fn trial_shares_the_essential_price() {
        let config = test_config();
        assert_eq!(config.price_for_plan(Plan::Trial), Some("price_ess"));
        assert_eq!(config.price_for_plan(Plan::Free), None);
    }
}
