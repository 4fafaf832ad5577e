//! Billing invariants
//!
//! Runnable consistency checks for the entitlement system. Each invariant
//! is a read-only SQL query that can be run after any mutation batch or
//! migration to confirm the data is still in a valid state; violations
//! carry enough context to debug from the report alone.

use roomlift_shared::{LimitSet, Quota, ResourceKey};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::Plan;
use crate::error::BillingResult;

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Users may be over- or under-entitled right now
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Informational oddity worth a look
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// A single invariant violation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Users affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    pub severity: ViolationSeverity,
}

/// Summary of a full invariant run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

/// Run all database invariants
pub async fn check_all(pool: &PgPool) -> BillingResult<InvariantCheckSummary> {
    let mut violations = Vec::new();
    let mut checks_run = 0;

    for check in [
        check_single_subscription_per_user(pool).await?,
        check_subscription_period_order(pool).await?,
        check_counter_period_order(pool).await?,
        check_negative_counters(pool).await?,
        check_orphaned_counters(pool).await?,
        check_orphaned_events(pool).await?,
    ] {
        checks_run += 1;
        violations.extend(check);
    }

    Ok(InvariantCheckSummary {
        checked_at: OffsetDateTime::now_utc(),
        checks_run,
        healthy: violations.is_empty(),
        violations,
    })
}

/// The unique index should make this impossible; a violation here means the
/// schema drifted
async fn check_single_subscription_per_user(
    pool: &PgPool,
) -> BillingResult<Vec<InvariantViolation>> {
    let rows: Vec<(Uuid, i64)> = sqlx::query_as(
        r#"
        SELECT user_id, COUNT(*) AS n
        FROM subscriptions
        GROUP BY user_id
        HAVING COUNT(*) > 1
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(user_id, n)| InvariantViolation {
            invariant: "single_subscription_per_user".to_string(),
            user_ids: vec![user_id],
            description: format!("user {} has {} subscription rows", user_id, n),
            severity: ViolationSeverity::Critical,
        })
        .collect())
}

async fn check_subscription_period_order(pool: &PgPool) -> BillingResult<Vec<InvariantViolation>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT user_id FROM subscriptions WHERE period_start >= period_end",
    )
    .fetch_all(pool)
    .await?;

    Ok(inverted_period_violations(
        "subscription_period_order",
        "subscription period_start is not before period_end",
        rows,
    ))
}

async fn check_counter_period_order(pool: &PgPool) -> BillingResult<Vec<InvariantViolation>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT DISTINCT user_id FROM usage_counters WHERE period_start >= period_end",
    )
    .fetch_all(pool)
    .await?;

    Ok(inverted_period_violations(
        "counter_period_order",
        "usage counter period_start is not before period_end",
        rows,
    ))
}

fn inverted_period_violations(
    invariant: &str,
    description: &str,
    rows: Vec<(Uuid,)>,
) -> Vec<InvariantViolation> {
    if rows.is_empty() {
        return Vec::new();
    }
    vec![InvariantViolation {
        invariant: invariant.to_string(),
        user_ids: rows.into_iter().map(|(id,)| id).collect(),
        description: description.to_string(),
        severity: ViolationSeverity::High,
    }]
}

/// Counters are monotonically non-decreasing, so a negative count means a
/// write bypassed the ledger
async fn check_negative_counters(pool: &PgPool) -> BillingResult<Vec<InvariantViolation>> {
    let rows: Vec<(Uuid, i64)> = sqlx::query_as(
        "SELECT user_id, count FROM usage_counters WHERE count < 0",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(user_id, count)| InvariantViolation {
            invariant: "non_negative_counters".to_string(),
            user_ids: vec![user_id],
            description: format!("user {} has a counter at {}", user_id, count),
            severity: ViolationSeverity::Critical,
        })
        .collect())
}

/// Counters only come into existence through the ledger, gated on an active
/// subscription, so a counter for a user with no subscription row means
/// usage was metered without entitlement
async fn check_orphaned_counters(pool: &PgPool) -> BillingResult<Vec<InvariantViolation>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT c.user_id
        FROM usage_counters c
        LEFT JOIN subscriptions s ON s.user_id = c.user_id
        WHERE s.user_id IS NULL
        "#,
    )
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![InvariantViolation {
        invariant: "counters_have_subscriptions".to_string(),
        user_ids: rows.into_iter().map(|(id,)| id).collect(),
        description: "usage counters exist for users with no subscription".to_string(),
        severity: ViolationSeverity::High,
    }])
}

async fn check_orphaned_events(pool: &PgPool) -> BillingResult<Vec<InvariantViolation>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT e.user_id
        FROM subscription_events e
        LEFT JOIN subscriptions s ON s.id = e.subscription_id
        WHERE s.id IS NULL
        "#,
    )
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![InvariantViolation {
        invariant: "events_reference_subscriptions".to_string(),
        user_ids: rows.into_iter().map(|(id,)| id).collect(),
        description: "subscription events reference missing subscription rows".to_string(),
        severity: ViolationSeverity::Low,
    }])
}

/// Pure check over a catalog: a strictly higher tier must never have a
/// strictly lower limit for any resource
pub fn check_tier_monotonicity(plans: &[Plan]) -> Vec<InvariantViolation> {
    let mut sorted: Vec<&Plan> = plans.iter().collect();
    sorted.sort_by_key(|p| p.tier.rank());

    let mut violations = Vec::new();
    for pair in sorted.windows(2) {
        let (lower, higher) = (pair[0], pair[1]);
        if lower.tier.rank() == higher.tier.rank() {
            continue;
        }
        for resource in ResourceKey::all() {
            if limit_shrinks(&lower.limits, &higher.limits, resource) {
                violations.push(InvariantViolation {
                    invariant: "tier_limit_monotonicity".to_string(),
                    user_ids: Vec::new(),
                    description: format!(
                        "{} limit for {} ({}) is lower than for {} ({})",
                        resource,
                        higher.slug,
                        higher.limits.get(resource),
                        lower.slug,
                        lower.limits.get(resource),
                    ),
                    severity: ViolationSeverity::High,
                });
            }
        }
    }
    violations
}

fn limit_shrinks(lower: &LimitSet, higher: &LimitSet, resource: ResourceKey) -> bool {
    match (lower.get(resource), higher.get(resource)) {
        (Quota::Limited(a), Quota::Limited(b)) => b < a,
        (Quota::Unlimited, Quota::Limited(_)) => true,
        (_, Quota::Unlimited) => false,
    }
}
