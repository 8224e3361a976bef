//! Usage quotas, cooldowns, and distributed locks for metered features
//!
//! Request invocations share no process memory, so every coordination
//! primitive here lives in the cache (cooldowns, lock leases) or the
//! authoritative store (period counters). The lease is advisory and
//! TTL-bounded: it favors availability over strict exclusion, and the
//! at-most-once guarantees that actually matter for money are enforced by
//! unique indexes in the store.
//!
//! The per-request state machine:
//! cooldown check → lock acquire → quota check → cooldown set → execute →
//! success: increment + release / failure: clear cooldown (if quota not
//! consumed) + release.

use std::sync::Arc;
use std::time::Duration;

use prepstack_shared::{Feature, GenerationMode, KvStore, Plan};
use rand::Rng;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult, RateLimitReason};

/// Lease TTL. Long enough to cover a slow generation call, short enough that
/// a crashed holder does not freeze the user out for long.
const LOCK_TTL: Duration = Duration::from_secs(60);

/// Question sets were once counted per-question; five questions per set.
/// See `normalize_legacy_count`.
const LEGACY_QUESTIONS_PER_SET: i64 = 5;

fn lock_key(feature: Feature, auth_user_id: &str) -> String {
    format!("lock:{}:{}", feature, auth_user_id)
}

fn cooldown_key(mode: GenerationMode, auth_user_id: &str) -> String {
    format!("cooldown:{}:{}", mode, auth_user_id)
}

/// Cooldown windows per mode, overridable for tests
#[derive(Debug, Clone)]
pub struct CooldownConfig {
    pub full: Duration,
    pub replace: Duration,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            full: Duration::from_secs(GenerationMode::Full.cooldown_seconds()),
            replace: Duration::from_secs(GenerationMode::Replace.cooldown_seconds()),
        }
    }
}

impl CooldownConfig {
    fn duration_for(&self, mode: GenerationMode) -> Duration {
        match mode {
            GenerationMode::Full => self.full,
            GenerationMode::Replace => self.replace,
        }
    }
}

/// Detect and repair counters stored in the legacy per-question unit.
///
/// Heuristic: the value exceeds the plan limit AND is an exact multiple of
/// the old unit size. Returns the normalized value, or `None` when the count
/// already looks sane. A coincidental multiple can misclassify; a
/// version-tagged counter schema would remove the ambiguity (recorded in
/// DESIGN.md).
pub fn normalize_legacy_count(count: i64, limit: i64, unit: i64) -> Option<i64> {
    if unit > 1 && count > limit && count % unit == 0 {
        Some(count / unit)
    } else {
        None
    }
}

// =============================================================================
// Cooldown gate
// =============================================================================

/// Minimum-interval rate limit, independent of quota. Each mode has its own
/// window so a rejected replace never consumes the full-generation window.
pub struct CooldownGate {
    cache: Arc<dyn KvStore>,
    config: CooldownConfig,
}

impl CooldownGate {
    pub fn new(cache: Arc<dyn KvStore>, config: CooldownConfig) -> Self {
        Self { cache, config }
    }

    /// Seconds until the window reopens, or `None` when clear.
    pub async fn remaining(
        &self,
        mode: GenerationMode,
        auth_user_id: &str,
    ) -> BillingResult<Option<u64>> {
        let duration = self.config.duration_for(mode);
        if duration.is_zero() {
            return Ok(None);
        }

        match self.cache.get(&cooldown_key(mode, auth_user_id)).await? {
            Some(raw) => {
                let last: i64 = raw.parse().unwrap_or(0);
                let now = OffsetDateTime::now_utc().unix_timestamp();
                let elapsed = (now - last).max(0) as u64;
                let window = duration.as_secs();
                if elapsed < window {
                    Ok(Some(window - elapsed))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    /// Stamp the window. Called BEFORE the expensive work, so two requests
    /// racing past the lock cannot both slip through before the window is
    /// visible.
    pub async fn stamp(&self, mode: GenerationMode, auth_user_id: &str) -> BillingResult<()> {
        let duration = self.config.duration_for(mode);
        if duration.is_zero() {
            return Ok(());
        }
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.cache
            .put(
                &cooldown_key(mode, auth_user_id),
                &now.to_string(),
                Some(duration),
            )
            .await?;
        Ok(())
    }

    /// Clear the window after a failed operation that consumed no quota, so
    /// a legitimate retry is not punished.
    pub async fn clear(&self, mode: GenerationMode, auth_user_id: &str) -> BillingResult<()> {
        self.cache.delete(&cooldown_key(mode, auth_user_id)).await?;
        Ok(())
    }
}

// =============================================================================
// Lease lock
// =============================================================================

/// A held lease. The value is a random fencing token: release only removes
/// the key while it still holds our token, so a request that outlived its
/// TTL cannot release the lease a later request now owns.
pub struct LeaseLock {
    cache: Arc<dyn KvStore>,
    key: String,
    token: String,
}

impl LeaseLock {
    /// Try to acquire the lease for a (feature, user) pair. `None` means
    /// another operation is in flight for that key.
    pub async fn acquire(
        cache: Arc<dyn KvStore>,
        feature: Feature,
        auth_user_id: &str,
    ) -> BillingResult<Option<Self>> {
        let key = lock_key(feature, auth_user_id);
        let token: String = {
            let mut rng = rand::thread_rng();
            (0..16)
                .map(|_| format!("{:02x}", rng.gen::<u8>()))
                .collect()
        };

        if cache.put_if_absent(&key, &token, LOCK_TTL).await? {
            Ok(Some(Self { cache, key, token }))
        } else {
            Ok(None)
        }
    }

    /// Release the lease if we still own it. Idempotent; an expired lease
    /// simply logs and moves on.
    pub async fn release(self) {
        match self.cache.delete_if_value(&self.key, &self.token).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(key = %self.key, "Lease expired before release; token no longer ours");
            }
            Err(e) => {
                // The TTL reclaims the key either way.
                tracing::warn!(key = %self.key, error = %e, "Lease release failed");
            }
        }
    }
}

// =============================================================================
// Quota service
// =============================================================================

/// Usage snapshot for one feature
#[derive(Debug, Clone, serde::Serialize)]
pub struct FeatureUsage {
    pub feature: Feature,
    pub used: i64,
    pub limit: i64,
}

/// A request that passed cooldown, lock, and quota checks and may execute
/// the metered operation. Exactly one of `commit` / `abort` must be called;
/// if the process dies in between, the lease TTL cleans up.
pub struct UsagePermit<'a> {
    service: &'a QuotaService,
    auth_user_id: String,
    feature: Feature,
    mode: GenerationMode,
    requested: i64,
    lock: LeaseLock,
}

impl<'a> UsagePermit<'a> {
    /// The operation succeeded: charge the quota, then release the lease.
    /// Returns the new used count. The cooldown stays stamped; quota was
    /// consumed, so repeated failures after this point cannot be used to
    /// bypass rate limiting.
    pub async fn commit(self) -> BillingResult<i64> {
        let charge = self
            .service
            .increment(&self.auth_user_id, self.feature, self.requested)
            .await;
        self.lock.release().await;
        charge
    }

    /// The operation failed before consuming quota: clear the cooldown so an
    /// immediate legitimate retry is allowed, then release the lease.
    pub async fn abort(self) -> BillingResult<()> {
        let cleared = self
            .service
            .cooldowns
            .clear(self.mode, &self.auth_user_id)
            .await;
        self.lock.release().await;
        cleared
    }
}

/// Quota and lock manager for metered operations
pub struct QuotaService {
    pool: PgPool,
    cache: Arc<dyn KvStore>,
    cooldowns: CooldownGate,
}

impl QuotaService {
    pub fn new(pool: PgPool, cache: Arc<dyn KvStore>) -> Self {
        Self::with_cooldowns(pool, cache, CooldownConfig::default())
    }

    pub fn with_cooldowns(
        pool: PgPool,
        cache: Arc<dyn KvStore>,
        config: CooldownConfig,
    ) -> Self {
        let cooldowns = CooldownGate::new(cache.clone(), config);
        Self {
            pool,
            cache,
            cooldowns,
        }
    }

    /// Run the admission state machine for a metered request.
    ///
    /// Order is load-bearing: cooldown before lock (cheap rejection first),
    /// quota only under the lock (so two readers cannot both see headroom),
    /// and the cooldown stamp before returning (so the window is visible
    /// before the expensive work starts).
    pub async fn begin(
        &self,
        auth_user_id: &str,
        plan: Plan,
        feature: Feature,
        mode: GenerationMode,
        requested: i64,
    ) -> BillingResult<UsagePermit<'_>> {
        let limit = plan.limit_for(feature);

        if let Some(retry_after) = self.cooldowns.remaining(mode, auth_user_id).await? {
            return Err(BillingError::RateLimited {
                reason: RateLimitReason::Cooldown,
                feature,
                used: 0,
                limit,
                retry_after_seconds: Some(retry_after),
            });
        }

        let lock = match LeaseLock::acquire(self.cache.clone(), feature, auth_user_id).await? {
            Some(lock) => lock,
            None => {
                return Err(BillingError::RateLimited {
                    reason: RateLimitReason::Concurrent,
                    feature,
                    used: 0,
                    limit,
                    retry_after_seconds: Some(LOCK_TTL.as_secs()),
                });
            }
        };

        let used = match self.current_usage(auth_user_id, feature, limit).await {
            Ok(used) => used,
            Err(e) => {
                lock.release().await;
                return Err(e);
            }
        };

        if used + requested > limit {
            lock.release().await;
            return Err(BillingError::RateLimited {
                reason: RateLimitReason::Quota,
                feature,
                used,
                limit,
                retry_after_seconds: None,
            });
        }

        if let Err(e) = self.cooldowns.stamp(mode, auth_user_id).await {
            lock.release().await;
            return Err(e);
        }

        Ok(UsagePermit {
            service: self,
            auth_user_id: auth_user_id.to_string(),
            feature,
            mode,
            requested,
            lock,
        })
    }

    /// Current period usage, normalizing legacy-unit counters in place
    /// before any comparison so a unit-of-measure change cannot permanently
    /// corrupt a user's quota.
    pub async fn current_usage(
        &self,
        auth_user_id: &str,
        feature: Feature,
        limit: i64,
    ) -> BillingResult<i64> {
        let period_key = feature.period().key_for(OffsetDateTime::now_utc());

        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT count FROM usage_counters
            WHERE auth_user_id = $1 AND feature = $2 AND period_key = $3
            "#,
        )
        .bind(auth_user_id)
        .bind(feature.as_str())
        .bind(&period_key)
        .fetch_optional(&self.pool)
        .await?;

        let count = row.map(|(c,)| c).unwrap_or(0);

        if let Some(normalized) = normalize_legacy_count(count, limit, LEGACY_QUESTIONS_PER_SET) {
            tracing::info!(
                user_id = %auth_user_id,
                feature = %feature,
                raw_count = count,
                normalized = normalized,
                "Normalized legacy per-question counter"
            );
            sqlx::query(
                r#"
                UPDATE usage_counters SET count = $1, updated_at = NOW()
                WHERE auth_user_id = $2 AND feature = $3 AND period_key = $4
                "#,
            )
            .bind(normalized)
            .bind(auth_user_id)
            .bind(feature.as_str())
            .bind(&period_key)
            .execute(&self.pool)
            .await?;
            return Ok(normalized);
        }

        Ok(count)
    }

    /// Charge the period counter. Upsert keyed by (user, feature, period):
    /// rollover is a fresh row, and the add is atomic in the store.
    async fn increment(
        &self,
        auth_user_id: &str,
        feature: Feature,
        amount: i64,
    ) -> BillingResult<i64> {
        let period_key = feature.period().key_for(OffsetDateTime::now_utc());

        let (count,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO usage_counters (auth_user_id, feature, period_key, count)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (auth_user_id, feature, period_key)
            DO UPDATE SET count = usage_counters.count + EXCLUDED.count, updated_at = NOW()
            RETURNING count
            "#,
        )
        .bind(auth_user_id)
        .bind(feature.as_str())
        .bind(&period_key)
        .bind(amount)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Usage for every metered feature, for the billing-status endpoint.
    pub async fn usage_summary(
        &self,
        auth_user_id: &str,
        plan: Plan,
    ) -> BillingResult<Vec<FeatureUsage>> {
        let mut summary = Vec::new();
        for feature in [Feature::QuestionSets, Feature::FeedbackReports] {
            let limit = plan.limit_for(feature);
            let used = self.current_usage(auth_user_id, feature, limit).await?;
            summary.push(FeatureUsage {
                feature,
                used,
                limit,
            });
        }
        Ok(summary)
    }

    /// Claim the one-time free grant for a feature. The unique index on
    /// (user, feature) is the real guarantee under concurrency; the
    /// constraint violation reads as "already claimed", never as a retry.
    pub async fn claim_free_grant(
        &self,
        auth_user_id: &str,
        feature: Feature,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            "INSERT INTO free_grants (auth_user_id, feature) VALUES ($1, $2)",
        )
        .bind(auth_user_id)
        .bind(feature.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if crate::error::is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prepstack_shared::MemoryStore;

    #[test]
    fn legacy_counts_normalize_only_when_heuristic_matches() {
        // 50 stored questions at 5 per set against a limit of 10 sets
        assert_eq!(normalize_legacy_count(50, 10, 5), Some(10));
        // Over the limit but not a multiple: left alone
        assert_eq!(normalize_legacy_count(47, 10, 5), None);
        // A multiple but within the limit: already in the new unit
        assert_eq!(normalize_legacy_count(10, 10, 5), None);
        assert_eq!(normalize_legacy_count(0, 10, 5), None);
        // Degenerate unit never divides
        assert_eq!(normalize_legacy_count(50, 10, 1), None);
    }

    #[tokio::test]
    async fn cooldown_blocks_within_window_and_reports_retry_after() {
        let cache: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let gate = CooldownGate::new(
            cache,
            CooldownConfig {
                full: Duration::from_secs(60),
                replace: Duration::from_secs(15),
            },
        );

        assert_eq!(gate.remaining(GenerationMode::Full, "u1").await.unwrap(), None);
        gate.stamp(GenerationMode::Full, "u1").await.unwrap();

        let remaining = gate
            .remaining(GenerationMode::Full, "u1")
            .await
            .unwrap()
            .unwrap();
        assert!(remaining > 0 && remaining <= 60);
    }

    #[tokio::test]
    async fn cooldown_windows_are_isolated_per_mode_and_user() {
        let cache: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let gate = CooldownGate::new(cache, CooldownConfig::default());

        gate.stamp(GenerationMode::Full, "u1").await.unwrap();

        // A full-generation stamp does not touch the replace window...
        assert_eq!(
            gate.remaining(GenerationMode::Replace, "u1").await.unwrap(),
            None
        );
        // ...or another user's window.
        assert_eq!(gate.remaining(GenerationMode::Full, "u2").await.unwrap(), None);

        // Clearing replace leaves full stamped.
        gate.stamp(GenerationMode::Replace, "u1").await.unwrap();
        gate.clear(GenerationMode::Replace, "u1").await.unwrap();
        assert_eq!(
            gate.remaining(GenerationMode::Replace, "u1").await.unwrap(),
            None
        );
        assert!(gate
            .remaining(GenerationMode::Full, "u1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let cache: Arc<dyn KvStore> = Arc::new(MemoryStore::new());

        let first = LeaseLock::acquire(cache.clone(), Feature::QuestionSets, "u1")
            .await
            .unwrap();
        assert!(first.is_some());

        let second = LeaseLock::acquire(cache.clone(), Feature::QuestionSets, "u1")
            .await
            .unwrap();
        assert!(second.is_none());

        // A different user's key is unaffected
        let other_user = LeaseLock::acquire(cache.clone(), Feature::QuestionSets, "u2")
            .await
            .unwrap();
        assert!(other_user.is_some());

        first.unwrap().release().await;
        let third = LeaseLock::acquire(cache, Feature::QuestionSets, "u1")
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn lock_protected_counter_never_exceeds_limit() {
        // N concurrent requests against limit L with increment 1: at most L
        // succeed, however the interleaving falls out. Losers here are
        // rejected as concurrent (lease held) or over-quota.
        const N: usize = 16;
        const LIMIT: i64 = 10;

        let cache: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let counter = Arc::new(tokio::sync::Mutex::new(0_i64));

        let mut handles = Vec::new();
        for _ in 0..N {
            let cache = cache.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    match LeaseLock::acquire(cache.clone(), Feature::QuestionSets, "u1")
                        .await
                        .unwrap()
                    {
                        Some(lock) => {
                            let mut used = counter.lock().await;
                            let granted = if *used + 1 <= LIMIT {
                                *used += 1;
                                true
                            } else {
                                false
                            };
                            drop(used);
                            lock.release().await;
                            return granted;
                        }
                        None => tokio::time::sleep(Duration::from_millis(1)).await,
                    }
                }
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }

        assert_eq!(successes, LIMIT);
        assert_eq!(*counter.lock().await, LIMIT);
    }

    mod db {
        //! Counter paths hit the authoritative store.
        use super::*;
        use prepstack_shared::db::create_pool;

        #[tokio::test]
        #[ignore] // Requires database
        async fn increment_is_atomic_and_rolls_over_by_period_key() {
            let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
            let pool = create_pool(&url, 3).await.expect("pool");
            let cache: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
            let service = QuotaService::new(pool, cache);

            let user = format!("test_{}", uuid::Uuid::new_v4());
            let first = service
                .increment(&user, Feature::QuestionSets, 1)
                .await
                .unwrap();
            let second = service
                .increment(&user, Feature::QuestionSets, 2)
                .await
                .unwrap();
            assert_eq!(first, 1);
            assert_eq!(second, 3);
        }

        #[tokio::test]
        #[ignore] // Requires database
        async fn free_grant_claims_exactly_once() {
            let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
            let pool = create_pool(&url, 3).await.expect("pool");
            let cache: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
            let service = QuotaService::new(pool, cache);

            let user = format!("test_{}", uuid::Uuid::new_v4());
            assert!(service
                .claim_free_grant(&user, Feature::QuestionSets)
                .await
                .unwrap());
            assert!(!service
                .claim_free_grant(&user, Feature::QuestionSets)
                .await
                .unwrap());
        }
    }
}
