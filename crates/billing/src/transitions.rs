//! Plan transition manager
//!
//! State machine over the subscription lifecycle: create, upgrade,
//! downgrade, cancel, reactivate, plus lazy billing-period rollover. Every
//! transition appends exactly one subscription event after the record
//! mutation succeeds; a failed event write is reported via tracing but never
//! rolls back the transition.
//!
//! Cancellation defaults to soft cancel (`cancel_at_period_end`): access
//! continues until the period ends, matching common SaaS convention.
//! [`PlanTransitionManager::cancel_subscription_immediately`] is the
//! explicit hard cancel.
//!
//! Plan changes never touch the usage ledger: a user upgrading mid-period
//! keeps their period-to-date usage, now measured against the new plan's
//! limits.

use std::sync::Arc;

use roomlift_shared::{Subscription, SubscriptionStatus, UserId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

use crate::catalog::{Plan, PlanCatalog};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, EventRecord, SubscriptionEventLog, SubscriptionEventType};
use crate::subscriptions::SubscriptionStore;

/// Direction of a plan change, by tier comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanChangeDirection {
    Upgraded,
    Downgraded,
}

impl PlanChangeDirection {
    /// Classify a change between tiers; a lateral move (same rank,
    /// different plan) counts as an upgrade for audit purposes
    pub fn classify(from_rank: u8, to_rank: u8) -> Self {
        if to_rank >= from_rank {
            Self::Upgraded
        } else {
            Self::Downgraded
        }
    }

    fn event_type(&self) -> SubscriptionEventType {
        match self {
            Self::Upgraded => SubscriptionEventType::Upgraded,
            Self::Downgraded => SubscriptionEventType::Downgraded,
        }
    }
}

/// Advance period bounds past `now` in whole cycles
///
/// Skipping multiple cycles at once covers subscriptions that were idle for
/// several periods; the new start is always a whole number of cycles after
/// the old start.
pub(crate) fn advance_period(
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    now: OffsetDateTime,
    cycle: Duration,
) -> (OffsetDateTime, OffsetDateTime) {
    let mut start = period_start;
    let mut end = period_end;
    while end <= now {
        start = end;
        end = end + cycle;
    }
    (start, end)
}

/// Plan transition manager
pub struct PlanTransitionManager {
    store: SubscriptionStore,
    catalog: Arc<PlanCatalog>,
    events: SubscriptionEventLog,
    cycle: Duration,
}

impl PlanTransitionManager {
    pub fn new(pool: PgPool, catalog: Arc<PlanCatalog>, cycle_days: i64) -> Self {
        Self {
            store: SubscriptionStore::new(pool.clone()),
            catalog,
            events: SubscriptionEventLog::new(pool),
            // A cycle below one day would keep advance_period from ever
            // passing now; config validation rejects it, this is the floor
            // for direct construction
            cycle: Duration::days(cycle_days.max(1)),
        }
    }

    pub fn store(&self) -> &SubscriptionStore {
        &self.store
    }

    /// Create a subscription for a user with none
    ///
    /// The period is anchored at now. Concurrent create calls collapse into
    /// one row via the store's upsert; the unique `user_id` index guarantees
    /// no duplicates either way.
    pub async fn create_subscription(
        &self,
        user_id: UserId,
        plan_slug: &str,
        actor: ActorType,
    ) -> BillingResult<Subscription> {
        let plan = self.require_plan_by_slug(plan_slug).await?;

        if let Some(existing) = self.store.get_active(user_id).await? {
            return Err(BillingError::AlreadyExists(format!(
                "user {} already has an active subscription (status {})",
                user_id, existing.status
            )));
        }

        let now = OffsetDateTime::now_utc();
        let sub = self
            .store
            .upsert(user_id, plan.id.0, now, now + self.cycle)
            .await?;

        tracing::info!(user_id = %user_id, plan = %plan.slug, "Subscription created");
        self.log_best_effort(
            EventRecord::new(user_id, sub.id, SubscriptionEventType::Created)
                .plans(None, Some(plan.id.0))
                .actor(actor),
        )
        .await;

        Ok(sub)
    }

    /// Switch an existing subscription to a different plan
    ///
    /// Valid from any non-terminal status. Usage counters and period bounds
    /// are untouched; only the limit the usage is compared against changes.
    pub async fn change_plan(
        &self,
        user_id: UserId,
        plan_slug: &str,
        actor: ActorType,
    ) -> BillingResult<(Subscription, PlanChangeDirection)> {
        let new_plan = self.require_plan_by_slug(plan_slug).await?;
        let sub = self
            .store
            .get(user_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(user_id.0))?;

        if sub.status.is_terminal() {
            return Err(BillingError::InvalidTransition(format!(
                "cannot change plan of a cancelled subscription for user {}",
                user_id
            )));
        }
        if sub.plan_id == new_plan.id.0 {
            return Err(BillingError::InvalidInput(format!(
                "user {} is already on the {} plan",
                user_id, new_plan.name
            )));
        }

        let old_plan = self.catalog.plan(sub.plan_id.into()).await?;
        let from_rank = old_plan.as_ref().map(|p| p.tier.rank()).unwrap_or(0);
        let direction = PlanChangeDirection::classify(from_rank, new_plan.tier.rank());

        let updated = self.store.set_plan(user_id, new_plan.id.0).await?;

        tracing::info!(
            user_id = %user_id,
            from = old_plan.as_ref().map(|p| p.slug.as_str()).unwrap_or("unknown"),
            to = %new_plan.slug,
            ?direction,
            "Plan changed"
        );
        self.log_best_effort(
            EventRecord::new(user_id, updated.id, direction.event_type())
                .plans(old_plan.map(|p| p.id.0), Some(new_plan.id.0))
                .actor(actor),
        )
        .await;

        Ok((updated, direction))
    }

    /// Cancel at period end (default policy)
    ///
    /// Status stays active and entitlements keep working until the period
    /// ends; the store finalizes the cancellation lazily on the first read
    /// after that.
    pub async fn cancel_subscription(
        &self,
        user_id: UserId,
        reason: Option<&str>,
        actor: ActorType,
    ) -> BillingResult<Subscription> {
        let sub = self
            .store
            .get(user_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(user_id.0))?;
        if sub.status.is_terminal() {
            return Err(BillingError::InvalidTransition(format!(
                "subscription for user {} is already cancelled",
                user_id
            )));
        }

        let updated = self.store.set_cancel_at_period_end(user_id, true).await?;

        tracing::info!(user_id = %user_id, period_end = %updated.period_end, "Soft cancel scheduled");
        let mut record = EventRecord::new(user_id, updated.id, SubscriptionEventType::Cancelled)
            .plans(Some(updated.plan_id), None)
            .actor(actor)
            .detail(serde_json::json!({ "mode": "at_period_end" }));
        if let Some(reason) = reason {
            record = record.reason(reason);
        }
        self.log_best_effort(record).await;

        Ok(updated)
    }

    /// Cancel now, revoking access immediately
    pub async fn cancel_subscription_immediately(
        &self,
        user_id: UserId,
        reason: Option<&str>,
        actor: ActorType,
    ) -> BillingResult<Subscription> {
        let sub = self
            .store
            .get(user_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(user_id.0))?;
        if sub.status.is_terminal() {
            return Err(BillingError::InvalidTransition(format!(
                "subscription for user {} is already cancelled",
                user_id
            )));
        }

        let updated = self
            .store
            .set_status(user_id, SubscriptionStatus::Cancelled)
            .await?;

        tracing::info!(user_id = %user_id, "Subscription cancelled immediately");
        let mut record = EventRecord::new(user_id, updated.id, SubscriptionEventType::Cancelled)
            .plans(Some(updated.plan_id), None)
            .actor(actor)
            .detail(serde_json::json!({ "mode": "immediate" }));
        if let Some(reason) = reason {
            record = record.reason(reason);
        }
        self.log_best_effort(record).await;

        Ok(updated)
    }

    /// Undo a cancellation that has not taken effect yet
    ///
    /// Valid while a soft cancel is pending, or after a hard cancel whose
    /// paid period has not elapsed (the grace window).
    pub async fn reactivate_subscription(
        &self,
        user_id: UserId,
        actor: ActorType,
    ) -> BillingResult<Subscription> {
        let sub = self
            .store
            .get(user_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(user_id.0))?;
        let now = OffsetDateTime::now_utc();

        let updated = if sub.cancel_at_period_end && !sub.status.is_terminal() && now < sub.period_end
        {
            self.store.set_cancel_at_period_end(user_id, false).await?
        } else if sub.status == SubscriptionStatus::Cancelled && now < sub.period_end {
            self.store.set_cancel_at_period_end(user_id, false).await?;
            self.store
                .set_status(user_id, SubscriptionStatus::Active)
                .await?
        } else if sub.status.is_terminal() || sub.cancel_at_period_end {
            return Err(BillingError::InvalidTransition(format!(
                "cancellation for user {} already took effect at {}",
                user_id, sub.period_end
            )));
        } else {
            return Err(BillingError::InvalidTransition(format!(
                "subscription for user {} is not cancelled",
                user_id
            )));
        };

        tracing::info!(user_id = %user_id, "Subscription reactivated");
        self.log_best_effort(
            EventRecord::new(user_id, updated.id, SubscriptionEventType::Reactivated)
                .plans(Some(updated.plan_id), Some(updated.plan_id))
                .actor(actor),
        )
        .await;

        Ok(updated)
    }

    /// Roll the billing period forward if it has elapsed
    ///
    /// Rollover is lazy: it happens on the first entitlement check after
    /// `period_end`, not in a background sweep. The update is a
    /// compare-and-set on the old `period_end`, so concurrent callers
    /// produce exactly one roll; losers re-read the rolled row. Usage
    /// counters are keyed by `period_start` and start fresh automatically.
    pub async fn roll_period_if_elapsed(&self, sub: &Subscription) -> BillingResult<Subscription> {
        let now = OffsetDateTime::now_utc();
        if now < sub.period_end {
            return Ok(sub.clone());
        }

        let (new_start, new_end) =
            advance_period(sub.period_start, sub.period_end, now, self.cycle);

        match self
            .store
            .roll_period(UserId(sub.user_id), sub.period_end, new_start, new_end)
            .await?
        {
            Some(rolled) => {
                tracing::info!(
                    user_id = %sub.user_id,
                    period_start = %new_start,
                    period_end = %new_end,
                    "Billing period rolled"
                );
                self.log_best_effort(
                    EventRecord::new(
                        UserId(rolled.user_id),
                        rolled.id,
                        SubscriptionEventType::PeriodRolled,
                    )
                    .plans(Some(rolled.plan_id), Some(rolled.plan_id))
                    .detail(serde_json::json!({
                        "previous_period_end": sub.period_end.to_string(),
                        "period_start": new_start.to_string(),
                        "period_end": new_end.to_string(),
                    })),
                )
                .await;
                Ok(rolled)
            }
            None => {
                // A concurrent caller won the roll; their bounds are ours.
                self.store
                    .get(UserId(sub.user_id))
                    .await?
                    .ok_or(BillingError::SubscriptionNotFound(sub.user_id))
            }
        }
    }

    async fn require_plan_by_slug(&self, slug: &str) -> BillingResult<Plan> {
        self.catalog
            .plan_by_slug(slug)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound(slug.to_string()))
    }

    /// Event logging is best-effort: the transition already committed, so a
    /// failed append is surfaced to observability instead of unwinding it
    async fn log_best_effort(&self, record: EventRecord) {
        let event_type = record.event_type;
        if let Err(e) = self.events.log(record).await {
            tracing::error!(event_type = %event_type, "Failed to log subscription event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_direction() {
        assert_eq!(
            PlanChangeDirection::classify(0, 1),
            PlanChangeDirection::Upgraded
        );
        assert_eq!(
            PlanChangeDirection::classify(2, 0),
            PlanChangeDirection::Downgraded
        );
        // Lateral moves audit as upgrades
        assert_eq!(
            PlanChangeDirection::classify(1, 1),
            PlanChangeDirection::Upgraded
        );
    }

    #[test]
    fn test_advance_period_single_cycle() {
        let start = OffsetDateTime::from_unix_timestamp(0).unwrap();
        let end = start + Duration::days(30);
        let now = end + Duration::days(1);
        let (new_start, new_end) = advance_period(start, end, now, Duration::days(30));
        assert_eq!(new_start, end);
        assert_eq!(new_end, end + Duration::days(30));
    }

    #[test]
    fn test_advance_period_skips_idle_cycles() {
        let start = OffsetDateTime::from_unix_timestamp(0).unwrap();
        let end = start + Duration::days(30);
        // Idle for ~3 periods
        let now = start + Duration::days(100);
        let (new_start, new_end) = advance_period(start, end, now, Duration::days(30));
        assert_eq!(new_start, start + Duration::days(90));
        assert_eq!(new_end, start + Duration::days(120));
        assert!(new_start <= now && now < new_end);
    }

    #[test]
    fn test_advance_period_boundary_is_exclusive() {
        let start = OffsetDateTime::from_unix_timestamp(0).unwrap();
        let end = start + Duration::days(30);
        // Exactly at period_end the old period is over
        let (new_start, new_end) = advance_period(start, end, end, Duration::days(30));
        assert_eq!(new_start, end);
        assert_eq!(new_end, end + Duration::days(30));
    }
}
