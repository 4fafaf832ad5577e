//! Usage ledger
//!
//! Per-user, per-resource, per-period consumption counters. This is the most
//! concurrency-sensitive part of the billing system: every mutation is a
//! single atomic upsert evaluated server-side, never a read-modify-write in
//! application code.
//!
//! ## Quota policy: hard limits
//!
//! [`UsageLedger::record_usage`] increments only when the post-increment
//! count stays within the limit, in one statement. Under N concurrent
//! single-unit calls against a quota of Q, exactly min(N, Q) succeed; the
//! rest receive a denial snapshot. [`UsageLedger::check_quota`] stays a pure
//! read for pre-flight checks and UI display.
//!
//! Counters are keyed on `(user_id, resource_key, period_start)`, so a
//! rolled billing period lands on a fresh zero row and prior rows survive
//! untouched as history.
//!
//! The ledger stores counts only; the limit for a resource is resolved by
//! the entitlement resolver and handed in as a parameter.

use roomlift_shared::{Quota, ResourceKey, UsageCounter, UserId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Point-in-time view of a counter against its limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Whether the requested amount was (or would be) within quota
    pub allowed: bool,
    pub used: i64,
    pub limit: Quota,
    /// Units left in the period; `None` when the limit is unlimited
    pub remaining: Option<i64>,
}

impl UsageSnapshot {
    /// Snapshot for a pure check: would consuming `amount` stay in quota?
    pub fn check(used: i64, limit: Quota, amount: i64) -> Self {
        Self {
            allowed: limit.allows(used, amount),
            used,
            limit,
            remaining: limit.remaining(used),
        }
    }

    /// Snapshot after a successful increment to `used`
    fn recorded(used: i64, limit: Quota) -> Self {
        Self {
            allowed: true,
            used,
            limit,
            remaining: limit.remaining(used),
        }
    }

    /// Snapshot for a denied increment; `used` is the unchanged count
    fn denied(used: i64, limit: Quota) -> Self {
        Self {
            allowed: false,
            used,
            limit,
            remaining: limit.remaining(used),
        }
    }
}

/// Usage metering service
#[derive(Clone)]
pub struct UsageLedger {
    pool: PgPool,
}

impl UsageLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch the counter for a period, creating a zero row if absent
    ///
    /// The create is a no-op upsert, so two concurrent first uses of a
    /// period agree on one row.
    pub async fn counter(
        &self,
        user_id: UserId,
        resource: ResourceKey,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<UsageCounter> {
        let counter: UsageCounter = sqlx::query_as(
            r#"
            INSERT INTO usage_counters (
                id, user_id, resource_key, count, period_start, period_end, created_at
            ) VALUES ($1, $2, $3, 0, $4, $5, NOW())
            ON CONFLICT (user_id, resource_key, period_start)
                DO UPDATE SET count = usage_counters.count
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id.0)
        .bind(resource)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await?;

        Ok(counter)
    }

    /// Current count for a period; zero when no counter row exists yet
    pub async fn used(
        &self,
        user_id: UserId,
        resource: ResourceKey,
        period_start: OffsetDateTime,
    ) -> BillingResult<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT count FROM usage_counters
            WHERE user_id = $1 AND resource_key = $2 AND period_start = $3
            "#,
        )
        .bind(user_id.0)
        .bind(resource)
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(c,)| c).unwrap_or(0))
    }

    /// Pure read: would consuming `amount` stay within `limit`?
    pub async fn check_quota(
        &self,
        user_id: UserId,
        resource: ResourceKey,
        period_start: OffsetDateTime,
        limit: Quota,
        amount: i64,
    ) -> BillingResult<UsageSnapshot> {
        validate_amount(amount)?;
        let used = self.used(user_id, resource, period_start).await?;
        Ok(UsageSnapshot::check(used, limit, amount))
    }

    /// Atomically consume `amount` units if the limit allows it
    ///
    /// One statement covers both the first use of a period (insert) and
    /// subsequent increments; the increment applies only when the
    /// post-increment count is within the limit. A denial is a returned
    /// snapshot, not an error.
    pub async fn record_usage(
        &self,
        user_id: UserId,
        resource: ResourceKey,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
        limit: Quota,
        amount: i64,
    ) -> BillingResult<UsageSnapshot> {
        validate_amount(amount)?;

        let limit_column = match limit {
            Quota::Limited(n) if amount > n => {
                // The insert path cannot express "insert only if within
                // limit", so an over-limit first consumption is refused up
                // front. `n` is plan data, not shared state, so there is no
                // race here.
                let used = self.used(user_id, resource, period_start).await?;
                return Ok(UsageSnapshot::denied(used, limit));
            }
            Quota::Limited(n) => Some(n),
            Quota::Unlimited => None,
        };

        let new_count: Option<(i64,)> = match limit_column {
            Some(limit_value) => {
                sqlx::query_as(
                    r#"
                    INSERT INTO usage_counters (
                        id, user_id, resource_key, count, period_start, period_end, created_at
                    ) VALUES ($1, $2, $3, $4, $5, $6, NOW())
                    ON CONFLICT (user_id, resource_key, period_start)
                        DO UPDATE SET count = usage_counters.count + $4
                        WHERE usage_counters.count + $4 <= $7
                    RETURNING count
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(user_id.0)
                .bind(resource)
                .bind(amount)
                .bind(period_start)
                .bind(period_end)
                .bind(limit_value)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    INSERT INTO usage_counters (
                        id, user_id, resource_key, count, period_start, period_end, created_at
                    ) VALUES ($1, $2, $3, $4, $5, $6, NOW())
                    ON CONFLICT (user_id, resource_key, period_start)
                        DO UPDATE SET count = usage_counters.count + $4
                    RETURNING count
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(user_id.0)
                .bind(resource)
                .bind(amount)
                .bind(period_start)
                .bind(period_end)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match new_count {
            Some((count,)) => {
                tracing::debug!(
                    user_id = %user_id,
                    resource = %resource,
                    count,
                    "Recorded usage"
                );
                Ok(UsageSnapshot::recorded(count, limit))
            }
            None => {
                let used = self.used(user_id, resource, period_start).await?;
                Ok(UsageSnapshot::denied(used, limit))
            }
        }
    }

    /// All counters anchored to a period, for plan-info style reporting
    pub async fn counters_for_period(
        &self,
        user_id: UserId,
        period_start: OffsetDateTime,
    ) -> BillingResult<Vec<UsageCounter>> {
        let counters: Vec<UsageCounter> = sqlx::query_as(
            r#"
            SELECT * FROM usage_counters
            WHERE user_id = $1 AND period_start = $2
            ORDER BY resource_key ASC
            "#,
        )
        .bind(user_id.0)
        .bind(period_start)
        .fetch_all(&self.pool)
        .await?;

        Ok(counters)
    }

    /// Historical counters for a resource, newest period first
    pub async fn history(
        &self,
        user_id: UserId,
        resource: ResourceKey,
        limit: i64,
    ) -> BillingResult<Vec<UsageCounter>> {
        let counters: Vec<UsageCounter> = sqlx::query_as(
            r#"
            SELECT * FROM usage_counters
            WHERE user_id = $1 AND resource_key = $2
            ORDER BY period_start DESC
            LIMIT $3
            "#,
        )
        .bind(user_id.0)
        .bind(resource)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(counters)
    }
}

fn validate_amount(amount: i64) -> BillingResult<()> {
    if amount < 1 {
        return Err(BillingError::InvalidInput(format!(
            "amount must be at least 1, got {}",
            amount
        )));
    }
    Ok(())
}
