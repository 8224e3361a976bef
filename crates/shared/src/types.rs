//! Common types used across PrepStack

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

// =============================================================================
// Plans
// =============================================================================

/// Subscription plan (entitlement tier)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Trial,
    Essential,
    Pro,
    Premium,
}

impl Plan {
    /// Ordinal used when ranking subscriptions. Free is unranked (-1) so any
    /// paid or trial subscription beats the absence of one.
    pub fn rank(&self) -> i8 {
        match self {
            Plan::Free => -1,
            Plan::Trial => 0,
            Plan::Essential => 1,
            Plan::Pro => 2,
            Plan::Premium => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Trial => "trial",
            Plan::Essential => "essential",
            Plan::Pro => "pro",
            Plan::Premium => "premium",
        }
    }

    pub fn is_paid(&self) -> bool {
        matches!(self, Plan::Essential | Plan::Pro | Plan::Premium)
    }

    /// Per-period limit for a metered feature.
    pub fn limit_for(&self, feature: Feature) -> i64 {
        match feature {
            Feature::QuestionSets => match self {
                Plan::Free => 2,
                Plan::Trial | Plan::Essential => 10,
                Plan::Pro => 25,
                Plan::Premium => 60,
            },
            Feature::FeedbackReports => match self {
                Plan::Free => 1,
                Plan::Trial | Plan::Essential => 20,
                Plan::Pro => 60,
                Plan::Premium => 200,
            },
        }
    }

    /// Whether the plan covers a feature at all. Quota rejection (429) is a
    /// separate concern from entitlement rejection (403).
    pub fn covers(&self, feature: Feature) -> bool {
        self.limit_for(feature) > 0
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "trial" => Ok(Plan::Trial),
            "essential" => Ok(Plan::Essential),
            "pro" => Ok(Plan::Pro),
            "premium" => Ok(Plan::Premium),
            _ => Err(format!("Unknown plan: {}", s)),
        }
    }
}

// =============================================================================
// Subscription status
// =============================================================================

/// Subscription status as reported by the payment provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
}

impl SubscriptionStatus {
    /// Ordinal used when ranking subscriptions: live states win over dead
    /// ones, and a paying subscription wins over a trial.
    pub fn rank(&self) -> u8 {
        match self {
            SubscriptionStatus::Active => 3,
            SubscriptionStatus::Trialing => 2,
            SubscriptionStatus::PastDue => 1,
            _ => 0,
        }
    }

    /// States in which the subscription still confers an entitlement.
    pub fn is_live(&self) -> bool {
        self.rank() > 0
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Paused => "paused",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Ok(SubscriptionStatus::IncompleteExpired),
            "paused" => Ok(SubscriptionStatus::Paused),
            _ => Err(format!("Unknown subscription status: {}", s)),
        }
    }
}

// =============================================================================
// Metered features
// =============================================================================

/// A metered feature with a per-period usage budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    QuestionSets,
    FeedbackReports,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::QuestionSets => "question_sets",
            Feature::FeedbackReports => "feedback_reports",
        }
    }

    pub fn period(&self) -> QuotaPeriod {
        match self {
            Feature::QuestionSets => QuotaPeriod::Day,
            Feature::FeedbackReports => QuotaPeriod::Month,
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Counter reset cadence for a metered feature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaPeriod {
    Day,
    Month,
}

impl QuotaPeriod {
    /// Key identifying the current period row, e.g. `2026-08-05` or `2026-08`.
    /// Rollover is a new key, never a reset of the old row.
    pub fn key_for(&self, now: OffsetDateTime) -> String {
        match self {
            QuotaPeriod::Day => format!(
                "{:04}-{:02}-{:02}",
                now.year(),
                now.month() as u8,
                now.day()
            ),
            QuotaPeriod::Month => format!("{:04}-{:02}", now.year(), now.month() as u8),
        }
    }
}

// =============================================================================
// Generation modes
// =============================================================================

/// Generation request modes, each with its own cooldown window so a rejected
/// replace does not burn the full-generation window and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    Full,
    Replace,
}

impl GenerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationMode::Full => "full",
            GenerationMode::Replace => "replace",
        }
    }

    pub fn cooldown_seconds(&self) -> u64 {
        match self {
            GenerationMode::Full => 60,
            GenerationMode::Replace => 15,
        }
    }
}

impl std::fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Account
// =============================================================================

/// Account row from the authoritative store. The cache only ever holds a
/// denormalized projection of this; the row is the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub auth_user_id: String,
    pub email: Option<String>,
    pub plan: Plan,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub subscription_status: Option<SubscriptionStatus>,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at: Option<OffsetDateTime>,
    pub scheduled_plan: Option<Plan>,
    pub scheduled_at: Option<OffsetDateTime>,
    pub has_ever_paid: bool,
    pub plan_updated_at: Option<OffsetDateTime>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for Account {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let plan: String = row.try_get("plan")?;
        let status: Option<String> = row.try_get("subscription_status")?;
        let scheduled: Option<String> = row.try_get("scheduled_plan")?;

        Ok(Self {
            auth_user_id: row.try_get("auth_user_id")?,
            email: row.try_get("email")?,
            plan: plan.parse().unwrap_or(Plan::Free),
            stripe_customer_id: row.try_get("stripe_customer_id")?,
            stripe_subscription_id: row.try_get("stripe_subscription_id")?,
            subscription_status: status.and_then(|s| s.parse().ok()),
            trial_ends_at: row.try_get("trial_ends_at")?,
            current_period_end: row.try_get("current_period_end")?,
            cancel_at: row.try_get("cancel_at")?,
            scheduled_plan: scheduled.and_then(|s| s.parse().ok()),
            scheduled_at: row.try_get("scheduled_at")?,
            has_ever_paid: row.try_get("has_ever_paid")?,
            plan_updated_at: row.try_get("plan_updated_at")?,
        })
    }
}

impl Account {
    /// Plan in force after resolving trial expiry against the current time.
    /// A lapsed trial with no paid subscription reads as free without waiting
    /// for the provider to say so.
    pub fn effective_plan(&self, now: OffsetDateTime) -> Plan {
        if self.plan == Plan::Trial {
            if let Some(trial_end) = self.trial_ends_at {
                if trial_end <= now {
                    return Plan::Free;
                }
            }
        }
        self.plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn plan_ranks_are_ordered() {
        assert!(Plan::Free.rank() < Plan::Trial.rank());
        assert!(Plan::Trial.rank() < Plan::Essential.rank());
        assert!(Plan::Essential.rank() < Plan::Pro.rank());
        assert!(Plan::Pro.rank() < Plan::Premium.rank());
    }

    #[test]
    fn status_ranks_match_rank_table() {
        assert_eq!(SubscriptionStatus::Active.rank(), 3);
        assert_eq!(SubscriptionStatus::Trialing.rank(), 2);
        assert_eq!(SubscriptionStatus::PastDue.rank(), 1);
        assert_eq!(SubscriptionStatus::Canceled.rank(), 0);
        assert_eq!(SubscriptionStatus::IncompleteExpired.rank(), 0);
    }

    #[test]
    fn plan_round_trips_through_str() {
        for plan in [
            Plan::Free,
            Plan::Trial,
            Plan::Essential,
            Plan::Pro,
            Plan::Premium,
        ] {
            assert_eq!(plan.as_str().parse::<Plan>().unwrap(), plan);
        }
        assert!("enterprise".parse::<Plan>().is_err());
    }

    #[test]
    fn period_keys_roll_over() {
        let jan31 = time::macros::datetime!(2026-01-31 23:59 UTC);
        let feb1 = time::macros::datetime!(2026-02-01 00:00 UTC);
        assert_eq!(QuotaPeriod::Day.key_for(jan31), "2026-01-31");
        assert_eq!(QuotaPeriod::Day.key_for(feb1), "2026-02-01");
        assert_eq!(QuotaPeriod::Month.key_for(jan31), "2026-01");
        assert_eq!(QuotaPeriod::Month.key_for(feb1), "2026-02");
    }

    #[test]
    fn cooldown_windows_are_independent_per_mode() {
        assert_ne!(
            GenerationMode::Full.cooldown_seconds(),
            GenerationMode::Replace.cooldown_seconds()
        );
    }

    #[test]
    fn lapsed_trial_reads_as_free() {
        let now = OffsetDateTime::now_utc();
        let account = Account {
            auth_user_id: "user_1".to_string(),
            email: None,
            plan: Plan::Trial,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            subscription_status: Some(SubscriptionStatus::Trialing),
            trial_ends_at: Some(now - Duration::hours(1)),
            current_period_end: None,
            cancel_at: None,
            scheduled_plan: None,
            scheduled_at: None,
            has_ever_paid: false,
            plan_updated_at: None,
        };
        assert_eq!(account.effective_plan(now), Plan::Free);

        let live = Account {
            trial_ends_at: Some(now + Duration::days(3)),
            ..account
        };
        assert_eq!(live.effective_plan(now), Plan::Trial);
    }
}
