//! Entitlement resolver
//!
//! Combines the plan catalog, subscription store, and usage ledger into the
//! allow/deny decision for "may this user do this right now?". This module
//! is the single authority that maps a resource key to its limit; the
//! ledger only stores counts and is handed the limit as a parameter.
//!
//! Business denials are first-class return values with a structured reason,
//! never errors. A [`BillingError`] from these functions means the decision
//! could not be computed; callers gating a metered action must treat that as
//! a deny (fail closed), or a storage outage would turn into unmetered
//! usage.

use std::sync::Arc;

use roomlift_shared::{
    FeatureKey, Quota, ResourceKey, Subscription, SubscriptionStatus, UserId,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::catalog::{Plan, PlanCatalog};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{UsageLedger, UsageSnapshot};
use crate::subscriptions::SubscriptionStore;
use crate::transitions::PlanTransitionManager;

/// Allow/deny decision for a boolean feature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Allow/deny decision for consuming a metered resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeDecision {
    pub allowed: bool,
    pub used: i64,
    pub limit: Quota,
    pub remaining: Option<i64>,
    pub reason: Option<String>,
}

impl ConsumeDecision {
    fn from_snapshot(resource: ResourceKey, snapshot: UsageSnapshot) -> Self {
        let reason = if snapshot.allowed {
            None
        } else {
            Some(quota_denial_reason(resource, snapshot.used, snapshot.limit))
        };
        Self {
            allowed: snapshot.allowed,
            used: snapshot.used,
            limit: snapshot.limit,
            remaining: snapshot.remaining,
            reason,
        }
    }

    /// Denial before any quota was consulted (no subscription, bad status)
    fn gated(reason: String) -> Self {
        Self {
            allowed: false,
            used: 0,
            limit: Quota::Limited(0),
            remaining: Some(0),
            reason: Some(reason),
        }
    }
}

/// Usage of one resource within the current period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub resource: ResourceKey,
    pub used: i64,
    pub limit: Quota,
    pub remaining: Option<i64>,
}

/// Everything a dashboard needs about a user's plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPlanInfo {
    pub plan: Plan,
    pub subscription: Subscription,
    pub usage: Vec<ResourceUsage>,
}

/// Deny reason for a subscription status that does not grant access
fn status_denial_reason(status: SubscriptionStatus) -> Option<String> {
    if status.is_entitled() {
        None
    } else {
        Some(format!("subscription is {}", status))
    }
}

/// Deny reason for a feature the plan does not include
fn feature_denial_reason(key: FeatureKey, plan: &Plan) -> String {
    format!("{} is not included in the {} plan", key, plan.name)
}

/// Deny reason for an exhausted quota
fn quota_denial_reason(resource: ResourceKey, used: i64, limit: Quota) -> String {
    format!("{} quota exceeded: {} of {} used", resource, used, limit)
}

/// Whether the subscription's trial window is still open
///
/// Hook for trial-specific gating relaxations; the default resolver treats
/// trialing like active and does not consult this beyond status.
pub fn trial_active(sub: &Subscription, now: OffsetDateTime) -> bool {
    sub.trial_end.map(|end| now < end).unwrap_or(false)
}

/// Entitlement resolution service
pub struct EntitlementResolver {
    store: SubscriptionStore,
    catalog: Arc<PlanCatalog>,
    ledger: UsageLedger,
    transitions: PlanTransitionManager,
}

/// Internal result of the shared gating steps
enum Gate {
    Entitled(Box<(Subscription, Plan)>),
    Denied(String),
}

impl EntitlementResolver {
    pub fn new(pool: PgPool, catalog: Arc<PlanCatalog>, cycle_days: i64) -> Self {
        Self {
            store: SubscriptionStore::new(pool.clone()),
            catalog: catalog.clone(),
            ledger: UsageLedger::new(pool.clone()),
            transitions: PlanTransitionManager::new(pool, catalog, cycle_days),
        }
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    pub fn transitions(&self) -> &PlanTransitionManager {
        &self.transitions
    }

    /// Shared gating: load the subscription, check its status, resolve the
    /// plan, and roll an elapsed period forward before any quota math
    async fn gate(&self, user_id: UserId) -> BillingResult<Gate> {
        let Some(sub) = self.store.get_active(user_id).await? else {
            return Ok(Gate::Denied("no active subscription".to_string()));
        };

        if let Some(reason) = status_denial_reason(sub.status) {
            return Ok(Gate::Denied(reason));
        }

        let sub = self.transitions.roll_period_if_elapsed(&sub).await?;

        let plan = self
            .catalog
            .plan(sub.plan_id.into())
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "subscription {} references unknown plan {}",
                    sub.id, sub.plan_id
                ))
            })?;

        Ok(Gate::Entitled(Box::new((sub, plan))))
    }

    /// May the user exercise a boolean plan capability right now?
    pub async fn can_use(&self, user_id: UserId, key: FeatureKey) -> BillingResult<Decision> {
        match self.gate(user_id).await? {
            Gate::Denied(reason) => Ok(Decision::deny(reason)),
            Gate::Entitled(boxed) => {
                let (_, plan) = *boxed;
                if plan.features.has(key) {
                    Ok(Decision::allow())
                } else {
                    Ok(Decision::deny(feature_denial_reason(key, &plan)))
                }
            }
        }
    }

    /// Pure pre-check: may the user consume `amount` units of a resource?
    ///
    /// This does not reserve anything; the authoritative gate is
    /// [`Self::record_usage`], whose increment is atomic against the limit.
    pub async fn can_consume(
        &self,
        user_id: UserId,
        resource: ResourceKey,
        amount: i64,
    ) -> BillingResult<ConsumeDecision> {
        match self.gate(user_id).await? {
            Gate::Denied(reason) => Ok(ConsumeDecision::gated(reason)),
            Gate::Entitled(boxed) => {
                let (sub, plan) = *boxed;
                let limit = plan.limits.get(resource);
                let snapshot = self
                    .ledger
                    .check_quota(user_id, resource, sub.period_start, limit, amount)
                    .await?;
                Ok(ConsumeDecision::from_snapshot(resource, snapshot))
            }
        }
    }

    /// Consume `amount` units of a resource, atomically enforcing the limit
    ///
    /// Call after the side-effecting action succeeded, or use as the
    /// combined reserve step before it; either way the increment only
    /// happens while within quota.
    pub async fn record_usage(
        &self,
        user_id: UserId,
        resource: ResourceKey,
        amount: i64,
    ) -> BillingResult<ConsumeDecision> {
        match self.gate(user_id).await? {
            Gate::Denied(reason) => Ok(ConsumeDecision::gated(reason)),
            Gate::Entitled(boxed) => {
                let (sub, plan) = *boxed;
                let limit = plan.limits.get(resource);
                let snapshot = self
                    .ledger
                    .record_usage(
                        user_id,
                        resource,
                        sub.period_start,
                        sub.period_end,
                        limit,
                        amount,
                    )
                    .await?;
                Ok(ConsumeDecision::from_snapshot(resource, snapshot))
            }
        }
    }

    /// Plan, subscription, and per-resource usage for the current period
    ///
    /// `None` when the user has no subscription that still grants or can
    /// grant access. Unlike the gating paths this also reports past_due and
    /// in-grace-cancelled subscriptions, so dashboards can show why access
    /// is blocked.
    pub async fn user_plan_info(&self, user_id: UserId) -> BillingResult<Option<UserPlanInfo>> {
        let Some(mut sub) = self.store.get_active(user_id).await? else {
            return Ok(None);
        };
        if sub.status.is_entitled() {
            sub = self.transitions.roll_period_if_elapsed(&sub).await?;
        }

        let plan = self
            .catalog
            .plan(sub.plan_id.into())
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "subscription {} references unknown plan {}",
                    sub.id, sub.plan_id
                ))
            })?;

        let mut usage = Vec::with_capacity(ResourceKey::all().len());
        for resource in ResourceKey::all() {
            let used = self
                .ledger
                .used(user_id, resource, sub.period_start)
                .await?;
            let limit = plan.limits.get(resource);
            usage.push(ResourceUsage {
                resource,
                used,
                limit,
                remaining: limit.remaining(used),
            });
        }

        Ok(Some(UserPlanInfo {
            plan,
            subscription: sub,
            usage,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomlift_shared::PlanTier;

    #[test]
    fn test_status_denial_reasons() {
        assert_eq!(status_denial_reason(SubscriptionStatus::Active), None);
        assert_eq!(status_denial_reason(SubscriptionStatus::Trialing), None);
        assert_eq!(
            status_denial_reason(SubscriptionStatus::PastDue).as_deref(),
            Some("subscription is past_due")
        );
        assert_eq!(
            status_denial_reason(SubscriptionStatus::Incomplete).as_deref(),
            Some("subscription is incomplete")
        );
    }

    #[test]
    fn test_feature_denial_names_the_plan() {
        let starter = Plan::builtin(PlanTier::Starter);
        let reason = feature_denial_reason(FeatureKey::TeamCollaboration, &starter);
        assert!(reason.contains("Starter"));
        assert!(reason.contains("team_collaboration"));
        // Deterministic across calls
        assert_eq!(
            reason,
            feature_denial_reason(FeatureKey::TeamCollaboration, &starter)
        );
    }

    #[test]
    fn test_quota_denial_reason() {
        let reason = quota_denial_reason(ResourceKey::Transformations, 5, Quota::Limited(5));
        assert_eq!(reason, "transformations quota exceeded: 5 of 5 used");
    }

    #[test]
    fn test_consume_decision_from_denied_snapshot() {
        let snapshot = UsageSnapshot::check(5, Quota::Limited(5), 1);
        let decision = ConsumeDecision::from_snapshot(ResourceKey::Transformations, snapshot);
        assert!(!decision.allowed);
        assert_eq!(decision.used, 5);
        assert_eq!(decision.remaining, Some(0));
        assert!(decision.reason.unwrap().contains("quota exceeded"));
    }

    #[test]
    fn test_consume_decision_from_allowed_snapshot() {
        let snapshot = UsageSnapshot::check(0, Quota::Unlimited, 1);
        let decision = ConsumeDecision::from_snapshot(ResourceKey::Transformations, snapshot);
        assert!(decision.allowed);
        assert_eq!(decision.limit, Quota::Unlimited);
        assert_eq!(decision.remaining, None);
        assert!(decision.reason.is_none());
    }

    #[test]
    fn test_trial_active_hook() {
        let now = OffsetDateTime::now_utc();
        let sub = Subscription {
            id: uuid::Uuid::new_v4(),
            user_id: uuid::Uuid::new_v4(),
            plan_id: uuid::Uuid::new_v4(),
            status: SubscriptionStatus::Trialing,
            period_start: now,
            period_end: now + time::Duration::days(30),
            cancel_at_period_end: false,
            trial_end: Some(now + time::Duration::days(14)),
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(trial_active(&sub, now));
        assert!(!trial_active(&sub, now + time::Duration::days(15)));

        let no_trial = Subscription {
            trial_end: None,
            ..sub
        };
        assert!(!trial_active(&no_trial, now));
    }
}
