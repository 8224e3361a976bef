//! Plan resolution
//!
//! Pure ranking and mapping logic that decides "what plan does this
//! subscription confer". Deterministic and side-effect free; everything that
//! touches Stripe or the store lives in the surrounding services.

use prepstack_shared::{Plan, SubscriptionStatus};
use stripe::Subscription;

use crate::client::StripeConfig;

/// Flattened view of a provider subscription, carrying exactly the fields
/// plan resolution needs.
#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    pub created: i64,
    pub trial_end: Option<i64>,
    pub cancel_at: Option<i64>,
    pub current_period_end: i64,
    /// `metadata.original_plan`, set at checkout. Distinguishes a trial from
    /// a paid essential subscription, which share a price.
    pub original_plan: Option<String>,
}

impl SubscriptionSnapshot {
    pub fn from_stripe(subscription: &Subscription) -> Self {
        let status = match subscription.status {
            stripe::SubscriptionStatus::Active => SubscriptionStatus::Active,
            stripe::SubscriptionStatus::Trialing => SubscriptionStatus::Trialing,
            stripe::SubscriptionStatus::PastDue => SubscriptionStatus::PastDue,
            stripe::SubscriptionStatus::Canceled => SubscriptionStatus::Canceled,
            stripe::SubscriptionStatus::Unpaid => SubscriptionStatus::Unpaid,
            stripe::SubscriptionStatus::Incomplete => SubscriptionStatus::Incomplete,
            stripe::SubscriptionStatus::IncompleteExpired => {
                SubscriptionStatus::IncompleteExpired
            }
            stripe::SubscriptionStatus::Paused => SubscriptionStatus::Paused,
        };

        let price_id = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|p| p.id.to_string());

        Self {
            id: subscription.id.to_string(),
            status,
            price_id,
            created: subscription.created,
            trial_end: subscription.trial_end,
            cancel_at: subscription.cancel_at,
            current_period_end: subscription.current_period_end,
            original_plan: subscription.metadata.get("original_plan").cloned(),
        }
    }
}

/// Derive the plan a subscription confers.
///
/// Trialing with `original_plan = trial` is a trial; active or past_due maps
/// through the price; everything else confers nothing. The price lookup does
/// NOT default to essential here: an unrecognized price on a live
/// subscription falls through to free so a config gap never grants access.
pub fn effective_plan(snapshot: &SubscriptionSnapshot, config: &StripeConfig) -> Plan {
    match snapshot.status {
        SubscriptionStatus::Trialing => {
            if snapshot.original_plan.as_deref() == Some("trial") {
                Plan::Trial
            } else {
                plan_from_price(snapshot, config)
            }
        }
        SubscriptionStatus::Active | SubscriptionStatus::PastDue => {
            plan_from_price(snapshot, config)
        }
        _ => Plan::Free,
    }
}

fn plan_from_price(snapshot: &SubscriptionSnapshot, config: &StripeConfig) -> Plan {
    snapshot
        .price_id
        .as_deref()
        .and_then(|price| config.plan_for_price(price, false))
        .unwrap_or(Plan::Free)
}

/// Select the single subscription that should determine the account's plan
/// when a customer holds more than one (duplicate subscriptions from
/// double-clicked checkouts are the common case).
///
/// Total order: status rank desc, then plan rank desc, then created desc,
/// then id. Ties cannot survive, and re-sorting is stable.
pub fn pick_best_subscription<'a>(
    subscriptions: &'a [SubscriptionSnapshot],
    config: &StripeConfig,
) -> Option<&'a SubscriptionSnapshot> {
    subscriptions.iter().max_by(|a, b| {
        a.status
            .rank()
            .cmp(&b.status.rank())
            .then_with(|| {
                effective_plan(a, config)
                    .rank()
                    .cmp(&effective_plan(b, config).rank())
            })
            .then_with(|| a.created.cmp(&b.created))
            // Deterministic final tiebreak; max_by keeps the later element on
            // Equal, which would make the result order-dependent.
            .then_with(|| a.id.cmp(&b.id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PriceIds;

    fn test_config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test".to_string(),
            webhook_secret: "whsec_test".to_string(),
            price_ids: PriceIds {
                essential: vec!["price_ess".to_string()],
                pro: vec!["price_pro".to_string()],
                premium: vec!["price_prem".to_string()],
            },
            app_base_url: "http://localhost".to_string(),
        }
    }

    fn snapshot(
        id: &str,
        status: SubscriptionStatus,
        price: Option<&str>,
        created: i64,
    ) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            id: id.to_string(),
            status,
            price_id: price.map(String::from),
            created,
            trial_end: None,
            cancel_at: None,
            current_period_end: created + 30 * 86_400,
            original_plan: None,
        }
    }

    #[test]
    fn trialing_with_trial_metadata_is_trial() {
        let config = test_config();
        let mut sub = snapshot("sub_1", SubscriptionStatus::Trialing, Some("price_ess"), 100);
        sub.original_plan = Some("trial".to_string());
        assert_eq!(effective_plan(&sub, &config), Plan::Trial);
    }

    #[test]
    fn trialing_without_trial_metadata_maps_through_price() {
        let config = test_config();
        let sub = snapshot("sub_1", SubscriptionStatus::Trialing, Some("price_pro"), 100);
        assert_eq!(effective_plan(&sub, &config), Plan::Pro);
    }

    #[test]
    fn active_and_past_due_map_through_price() {
        let config = test_config();
        let active = snapshot("sub_1", SubscriptionStatus::Active, Some("price_prem"), 100);
        assert_eq!(effective_plan(&active, &config), Plan::Premium);

        let past_due = snapshot("sub_2", SubscriptionStatus::PastDue, Some("price_ess"), 100);
        assert_eq!(effective_plan(&past_due, &config), Plan::Essential);
    }

    #[test]
    fn dead_statuses_confer_nothing() {
        let config = test_config();
        for status in [
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::IncompleteExpired,
            SubscriptionStatus::Paused,
        ] {
            let sub = snapshot("sub_1", status, Some("price_pro"), 100);
            assert_eq!(effective_plan(&sub, &config), Plan::Free);
        }
    }

    #[test]
    fn unrecognized_price_on_live_subscription_confers_nothing() {
        let config = test_config();
        let sub = snapshot("sub_1", SubscriptionStatus::Active, Some("price_mystery"), 100);
        assert_eq!(effective_plan(&sub, &config), Plan::Free);
    }

    #[test]
    fn active_pro_beats_newer_trialing_trial() {
        // The newer trial does not win: status rank active(3) > trialing(2).
        let config = test_config();
        let active_pro = snapshot("sub_a", SubscriptionStatus::Active, Some("price_pro"), 100);
        let mut newer_trial =
            snapshot("sub_b", SubscriptionStatus::Trialing, Some("price_ess"), 200);
        newer_trial.original_plan = Some("trial".to_string());

        let subs = vec![newer_trial, active_pro];
        let best = pick_best_subscription(&subs, &config).unwrap();
        assert_eq!(best.id, "sub_a");
        assert_eq!(effective_plan(best, &config), Plan::Pro);
    }

    #[test]
    fn higher_plan_wins_within_same_status() {
        let config = test_config();
        let ess = snapshot("sub_a", SubscriptionStatus::Active, Some("price_ess"), 200);
        let prem = snapshot("sub_b", SubscriptionStatus::Active, Some("price_prem"), 100);

        let subs = [ess, prem];
        let best = pick_best_subscription(&subs, &config).unwrap();
        assert_eq!(best.id, "sub_b");
    }

    #[test]
    fn newest_wins_when_status_and_plan_tie() {
        // Duplicate checkout: two identical pro subscriptions a minute apart.
        let config = test_config();
        let older = snapshot("sub_a", SubscriptionStatus::Active, Some("price_pro"), 100);
        let newer = snapshot("sub_b", SubscriptionStatus::Active, Some("price_pro"), 160);

        let subs = [older, newer];
        let best = pick_best_subscription(&subs, &config).unwrap();
        assert_eq!(best.id, "sub_b");
    }

    #[test]
    fn selection_is_stable_under_reordering() {
        let config = test_config();
        let a = snapshot("sub_a", SubscriptionStatus::Active, Some("price_pro"), 100);
        let b = snapshot("sub_b", SubscriptionStatus::Trialing, Some("price_ess"), 300);
        let c = snapshot("sub_c", SubscriptionStatus::PastDue, Some("price_prem"), 200);

        let forward = vec![a.clone(), b.clone(), c.clone()];
        let backward = vec![c, b, a];

        let best_fwd = pick_best_subscription(&forward, &config).unwrap().id.clone();
        let best_bwd = pick_best_subscription(&backward, &config).unwrap().id.clone();
        assert_eq!(best_fwd, best_bwd);
        assert_eq!(best_fwd, "sub_a");
    }

    #[test]
    fn empty_list_selects_nothing() {
        let config = test_config();
        assert!(pick_best_subscription(&[], &config).is_none());
    }
}
