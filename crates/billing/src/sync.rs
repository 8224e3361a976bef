//! Dual-store sync sweeper
//!
//! Generated question sets are written to the cache first (the hot path must
//! not wait on the relational store) and flagged `needs_sync`. This sweeper
//! runs on a timer, mirrors flagged records into the authoritative store via
//! an idempotent upsert on the natural key, then clears the flag. It is the
//! defense against partial failures where the cache write landed but the
//! mirror did not.

use std::sync::Arc;

use prepstack_shared::cache::{get_json, put_json};
use prepstack_shared::KvStore;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;

/// Index of cache records awaiting a mirror write
const PENDING_SET: &str = "sync:pending";

fn record_key(auth_user_id: &str, set_id: &str) -> String {
    format!("qset:{}:{}", auth_user_id, set_id)
}

/// A generated question set as stored in the cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedQuestionSet {
    pub auth_user_id: String,
    pub set_id: String,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub needs_sync: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub synced_at: Option<OffsetDateTime>,
}

/// Validate a pending-set member of the form `qset:{user}:{set_id}`.
/// Returns the embedded identifiers, or `None` for anything malformed, so a
/// corrupt index entry can never be written into the wrong account.
pub fn parse_record_key(member: &str) -> Option<(&str, &str)> {
    let rest = member.strip_prefix("qset:")?;
    let (user, set_id) = rest.split_once(':')?;
    if user.is_empty() || set_id.is_empty() || set_id.contains(':') {
        return None;
    }
    Some((user, set_id))
}

/// Outcome counts for one sweep
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub synced: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Background reconciler for cache records flagged `needs_sync`
pub struct SyncSweeper {
    pool: PgPool,
    cache: Arc<dyn KvStore>,
}

impl SyncSweeper {
    pub fn new(pool: PgPool, cache: Arc<dyn KvStore>) -> Self {
        Self { pool, cache }
    }

    /// Write a freshly generated set to the cache and enqueue it for the
    /// sweeper. Called from the request path after a successful generation.
    pub async fn store_pending(
        &self,
        auth_user_id: &str,
        set_id: &str,
        payload: serde_json::Value,
    ) -> BillingResult<()> {
        let record = CachedQuestionSet {
            auth_user_id: auth_user_id.to_string(),
            set_id: set_id.to_string(),
            payload,
            generated_at: OffsetDateTime::now_utc(),
            needs_sync: true,
            synced_at: None,
        };
        let key = record_key(auth_user_id, set_id);
        put_json(self.cache.as_ref(), &key, &record, None).await?;
        self.cache.set_add(PENDING_SET, &key).await?;
        Ok(())
    }

    /// One sweep over everything flagged `needs_sync`. Upserts are keyed by
    /// (user, set_id), so repeated or parallel sweeps are commutative.
    pub async fn run_once(&self) -> BillingResult<SweepStats> {
        let members = self.cache.set_members(PENDING_SET).await?;
        let mut stats = SweepStats::default();

        for member in members {
            let Some((auth_user_id, set_id)) = parse_record_key(&member) else {
                // Never guess which account a malformed key belongs to.
                tracing::warn!(member = %member, "Skipping malformed sync index entry");
                self.cache.set_remove(PENDING_SET, &member).await?;
                stats.skipped += 1;
                continue;
            };

            let record: Option<CachedQuestionSet> =
                match get_json(self.cache.as_ref(), &member).await {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(member = %member, error = %e, "Skipping unreadable sync record");
                        stats.skipped += 1;
                        continue;
                    }
                };

            let Some(mut record) = record else {
                // Record expired or was deleted; drop the dangling index entry.
                self.cache.set_remove(PENDING_SET, &member).await?;
                stats.skipped += 1;
                continue;
            };

            if record.auth_user_id != auth_user_id || record.set_id != set_id {
                tracing::warn!(
                    member = %member,
                    record_user = %record.auth_user_id,
                    "Skipping sync record whose identifiers disagree with its key"
                );
                stats.skipped += 1;
                continue;
            }

            match self.mirror(&record).await {
                Ok(()) => {
                    record.needs_sync = false;
                    record.synced_at = Some(OffsetDateTime::now_utc());
                    if let Err(e) = put_json(self.cache.as_ref(), &member, &record, None).await {
                        tracing::warn!(member = %member, error = %e, "Failed to clear needs_sync flag");
                    }
                    self.cache.set_remove(PENDING_SET, &member).await?;
                    stats.synced += 1;
                }
                Err(e) => {
                    // Left in the pending set; the next sweep retries.
                    tracing::error!(member = %member, error = %e, "Mirror write failed");
                    stats.failed += 1;
                }
            }
        }

        if stats.synced + stats.skipped + stats.failed > 0 {
            tracing::info!(
                synced = stats.synced,
                skipped = stats.skipped,
                failed = stats.failed,
                "Sync sweep completed"
            );
        }

        Ok(stats)
    }

    async fn mirror(&self, record: &CachedQuestionSet) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO question_sets (auth_user_id, set_id, payload, generated_at, synced_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (auth_user_id, set_id) DO UPDATE SET
                payload = EXCLUDED.payload,
                generated_at = EXCLUDED.generated_at,
                synced_at = NOW()
            "#,
        )
        .bind(&record.auth_user_id)
        .bind(&record.set_id)
        .bind(&record.payload)
        .bind(record.generated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keys_parse_and_reject_garbage() {
        assert_eq!(
            parse_record_key("qset:user_1:set_abc"),
            Some(("user_1", "set_abc"))
        );
        assert_eq!(parse_record_key("qset:user_1:"), None);
        assert_eq!(parse_record_key("qset::set_abc"), None);
        assert_eq!(parse_record_key("qset:user_1:set:extra"), None);
        assert_eq!(parse_record_key("other:user_1:set_abc"), None);
        assert_eq!(parse_record_key(""), None);
    }

    #[test]
    fn cached_record_round_trips_through_json() {
        let record = CachedQuestionSet {
            auth_user_id: "user_1".to_string(),
            set_id: "set_1".to_string(),
            payload: serde_json::json!({"questions": ["q1", "q2"]}),
            generated_at: OffsetDateTime::now_utc(),
            needs_sync: true,
            synced_at: None,
        };
        let raw = serde_json::to_string(&record).unwrap();
        let parsed: CachedQuestionSet = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.auth_user_id, "user_1");
        assert!(parsed.needs_sync);
        assert!(parsed.synced_at.is_none());
    }
}
