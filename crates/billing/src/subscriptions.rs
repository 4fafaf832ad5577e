//! Subscription record store
//!
//! One subscription row per user, enforced by a unique index on `user_id`.
//! Every write path is an upsert keyed on that index, so two concurrent
//! checkout confirmations merge into one row instead of racing an insert.
//!
//! Transitions are not logged here; the transition manager owns the audit
//! trail.

use roomlift_shared::{Subscription, SubscriptionStatus, UserId};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Subscription record store
#[derive(Clone)]
pub struct SubscriptionStore {
    pool: PgPool,
}

impl SubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create or atomically replace the user's subscription
    ///
    /// Resets status to active and clears any pending cancellation; callers
    /// performing a plain plan change should use [`Self::set_plan`] instead.
    pub async fn upsert(
        &self,
        user_id: UserId,
        plan_id: Uuid,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        if period_start >= period_end {
            return Err(BillingError::InvalidInput(format!(
                "period_start {} must precede period_end {}",
                period_start, period_end
            )));
        }

        let sub: Subscription = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (
                id, user_id, plan_id, status, period_start, period_end,
                cancel_at_period_end, created_at, updated_at
            ) VALUES ($1, $2, $3, 'active', $4, $5, false, NOW(), NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                status = 'active',
                period_start = EXCLUDED.period_start,
                period_end = EXCLUDED.period_end,
                cancel_at_period_end = false,
                cancelled_at = NULL,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id.0)
        .bind(plan_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await?;

        Ok(sub)
    }

    /// Fetch the user's subscription row regardless of lifecycle state
    pub async fn get(&self, user_id: UserId) -> BillingResult<Option<Subscription>> {
        let sub: Option<Subscription> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE user_id = $1")
                .bind(user_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(sub)
    }

    /// Fetch the user's subscription if it still grants or can grant access
    ///
    /// Returns `None` when no row exists or the record is terminally
    /// cancelled (cancelled and past `period_end`). A pending soft cancel
    /// whose period has elapsed is finalized here, lazily, on first read.
    pub async fn get_active(&self, user_id: UserId) -> BillingResult<Option<Subscription>> {
        let Some(mut sub) = self.get(user_id).await? else {
            return Ok(None);
        };
        let now = OffsetDateTime::now_utc();

        if sub.cancel_at_period_end && !sub.status.is_terminal() && now >= sub.period_end {
            sub = self.finalize_soft_cancel(user_id, sub.period_end).await?;
            tracing::info!(user_id = %user_id, "Soft cancellation took effect at period end");
        }

        if sub.status.is_terminal() && now >= sub.period_end {
            return Ok(None);
        }
        Ok(Some(sub))
    }

    /// Flip a pending soft cancel to a terminal cancelled state
    async fn finalize_soft_cancel(
        &self,
        user_id: UserId,
        period_end: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let sub: Subscription = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = 'cancelled',
                cancelled_at = COALESCE(cancelled_at, $2),
                updated_at = NOW()
            WHERE user_id = $1
            RETURNING *
            "#,
        )
        .bind(user_id.0)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await?;
        Ok(sub)
    }

    /// Set the lifecycle status
    pub async fn set_status(
        &self,
        user_id: UserId,
        status: SubscriptionStatus,
    ) -> BillingResult<Subscription> {
        let cancelled_at = match status {
            SubscriptionStatus::Cancelled => Some(OffsetDateTime::now_utc()),
            _ => None,
        };
        let sub: Option<Subscription> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = $2,
                cancelled_at = $3,
                updated_at = NOW()
            WHERE user_id = $1
            RETURNING *
            "#,
        )
        .bind(user_id.0)
        .bind(status)
        .bind(cancelled_at)
        .fetch_optional(&self.pool)
        .await?;

        sub.ok_or(BillingError::SubscriptionNotFound(user_id.0))
    }

    /// Set or clear the end-of-period cancellation flag
    pub async fn set_cancel_at_period_end(
        &self,
        user_id: UserId,
        cancel: bool,
    ) -> BillingResult<Subscription> {
        let sub: Option<Subscription> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET cancel_at_period_end = $2,
                updated_at = NOW()
            WHERE user_id = $1
            RETURNING *
            "#,
        )
        .bind(user_id.0)
        .bind(cancel)
        .fetch_optional(&self.pool)
        .await?;

        sub.ok_or(BillingError::SubscriptionNotFound(user_id.0))
    }

    /// Point the subscription at a different plan, leaving period and status
    /// untouched
    pub async fn set_plan(&self, user_id: UserId, plan_id: Uuid) -> BillingResult<Subscription> {
        let sub: Option<Subscription> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET plan_id = $2,
                updated_at = NOW()
            WHERE user_id = $1
            RETURNING *
            "#,
        )
        .bind(user_id.0)
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        sub.ok_or(BillingError::SubscriptionNotFound(user_id.0))
    }

    /// Advance the billing period, compare-and-set on the old `period_end`
    ///
    /// Returns the updated row, or `None` when a concurrent caller already
    /// rolled it (the caller should re-read and retry its decision).
    pub async fn roll_period(
        &self,
        user_id: UserId,
        old_period_end: OffsetDateTime,
        new_start: OffsetDateTime,
        new_end: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let sub: Option<Subscription> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET period_start = $3,
                period_end = $4,
                updated_at = NOW()
            WHERE user_id = $1 AND period_end = $2
            RETURNING *
            "#,
        )
        .bind(user_id.0)
        .bind(old_period_end)
        .bind(new_start)
        .bind(new_end)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sub)
    }
}
