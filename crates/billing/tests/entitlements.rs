//! Integration tests for the entitlement and usage-metering engine
//!
//! These tests run against a real Postgres database and verify the
//! concurrency guarantees that unit tests cannot: atomic usage increments,
//! the single-subscription upsert, and lazy period rollover.
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://localhost/roomlift_test"
//! cargo test -p roomlift-billing --test entitlements -- --ignored --test-threads=1
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::sync::Arc;

use roomlift_billing::{
    ActorType, BillingError, EntitlementResolver, PlanCatalog, PlanChangeDirection,
    SubscriptionEventLog,
};
use roomlift_shared::{
    FeatureKey, Quota, ResourceKey, SubscriptionStatus, UserId,
};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

// ============================================================================
// Test Utilities
// ============================================================================

const CYCLE_DAYS: i64 = 30;

/// Connect to the test database and build a resolver over it
async fn setup() -> (EntitlementResolver, PgPool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomlift_billing=debug".into()),
        )
        .with_test_writer()
        .try_init();

    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(16)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");

    roomlift_shared::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    let catalog = Arc::new(PlanCatalog::new(pool.clone()));
    let resolver = EntitlementResolver::new(pool.clone(), catalog, CYCLE_DAYS);
    (resolver, pool)
}

/// Each test uses a fresh random user, so tests do not interfere
fn fresh_user() -> UserId {
    UserId::new()
}

/// Push the subscription's period fully into the past to simulate an
/// elapsed billing cycle
async fn expire_period(pool: &PgPool, user: UserId) -> OffsetDateTime {
    let old_start = OffsetDateTime::now_utc() - Duration::days(CYCLE_DAYS + 3);
    let old_end = old_start + Duration::days(CYCLE_DAYS);
    sqlx::query(
        "UPDATE subscriptions SET period_start = $2, period_end = $3 WHERE user_id = $1",
    )
    .bind(user.0)
    .bind(old_start)
    .bind(old_end)
    .execute(pool)
    .await
    .expect("Failed to rewind period");
    // Re-anchor any existing counters to the rewound period
    sqlx::query(
        "UPDATE usage_counters SET period_start = $2, period_end = $3 WHERE user_id = $1",
    )
    .bind(user.0)
    .bind(old_start)
    .bind(old_end)
    .execute(pool)
    .await
    .expect("Failed to rewind counters");
    old_start
}

// ============================================================================
// Scenario A: Starter quota exhaustion
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn scenario_a_starter_quota_exhaustion() {
    let (resolver, _pool) = setup().await;
    let user = fresh_user();

    resolver
        .transitions()
        .create_subscription(user, "starter", ActorType::System)
        .await
        .unwrap();

    for i in 1..=5 {
        let decision = resolver
            .record_usage(user, ResourceKey::Transformations, 1)
            .await
            .unwrap();
        assert!(decision.allowed, "consumption {} should be within quota", i);
        assert_eq!(decision.used, i);
    }

    let sixth = resolver
        .can_consume(user, ResourceKey::Transformations, 1)
        .await
        .unwrap();
    assert!(!sixth.allowed);
    assert_eq!(sixth.used, 5);
    assert_eq!(sixth.limit, Quota::Limited(5));
    assert_eq!(sixth.remaining, Some(0));

    // The hard limit holds on the write path too
    let denied = resolver
        .record_usage(user, ResourceKey::Transformations, 1)
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.used, 5);
}

// ============================================================================
// Scenario B + P4: upgrade keeps usage, lifts the limit
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn scenario_b_upgrade_to_unlimited_keeps_usage() {
    let (resolver, _pool) = setup().await;
    let user = fresh_user();

    resolver
        .transitions()
        .create_subscription(user, "starter", ActorType::System)
        .await
        .unwrap();
    for _ in 0..5 {
        resolver
            .record_usage(user, ResourceKey::Transformations, 1)
            .await
            .unwrap();
    }

    let (_, direction) = resolver
        .transitions()
        .change_plan(user, "pro", ActorType::PaymentGateway)
        .await
        .unwrap();
    assert_eq!(direction, PlanChangeDirection::Upgraded);

    let check = resolver
        .can_consume(user, ResourceKey::Transformations, 1)
        .await
        .unwrap();
    assert!(check.allowed);
    assert_eq!(check.limit, Quota::Unlimited);
    assert_eq!(check.remaining, None);
    // Period-to-date usage survives the plan change
    assert_eq!(check.used, 5);
}

// ============================================================================
// P1: no over-count under concurrency (hard limit)
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn p1_concurrent_usage_respects_hard_limit() {
    let (resolver, pool) = setup().await;
    let resolver = Arc::new(resolver);
    let user = fresh_user();

    resolver
        .transitions()
        .create_subscription(user, "starter", ActorType::System)
        .await
        .unwrap();

    // Starter allows 5 transformations; fire 16 single-unit consumers
    let mut handles = Vec::new();
    for _ in 0..16 {
        let resolver = resolver.clone();
        handles.push(tokio::spawn(async move {
            resolver
                .record_usage(user, ResourceKey::Transformations, 1)
                .await
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        let decision = handle.await.unwrap().unwrap();
        if decision.allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 5, "exactly the quota may succeed");

    let (count,): (i64,) = sqlx::query_as(
        "SELECT count FROM usage_counters WHERE user_id = $1 AND resource_key = 'transformations'",
    )
    .bind(user.0)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 5, "no lost or extra increments");
}

// ============================================================================
// P2: single subscription under concurrent creates
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn p2_concurrent_creates_leave_one_row() {
    let (resolver, pool) = setup().await;
    let resolver = Arc::new(resolver);
    let user = fresh_user();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let resolver = resolver.clone();
        handles.push(tokio::spawn(async move {
            resolver
                .transitions()
                .create_subscription(user, "starter", ActorType::PaymentGateway)
                .await
        }));
    }

    let mut created = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            created += 1;
        }
    }
    assert!(created >= 1, "at least one create must win");

    let (rows,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM subscriptions WHERE user_id = $1")
            .bind(user.0)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(rows, 1, "concurrent creates must merge into one row");
}

// ============================================================================
// P3: lazy period rollover
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn p3_rollover_creates_fresh_counter_and_keeps_history() {
    let (resolver, pool) = setup().await;
    let user = fresh_user();

    resolver
        .transitions()
        .create_subscription(user, "starter", ActorType::System)
        .await
        .unwrap();
    for _ in 0..3 {
        resolver
            .record_usage(user, ResourceKey::Transformations, 1)
            .await
            .unwrap();
    }

    let old_start = expire_period(&pool, user).await;

    // First usage after the period elapsed rolls the subscription and lands
    // on a fresh counter
    let decision = resolver
        .record_usage(user, ResourceKey::Transformations, 1)
        .await
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.used, 1);
    assert_eq!(decision.remaining, Some(4));

    // The old period's counter is untouched history
    let (old_count,): (i64,) = sqlx::query_as(
        r#"
        SELECT count FROM usage_counters
        WHERE user_id = $1 AND resource_key = 'transformations' AND period_start = $2
        "#,
    )
    .bind(user.0)
    .bind(old_start)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(old_count, 3);

    // And the subscription's period now covers the present
    let info = resolver.user_plan_info(user).await.unwrap().unwrap();
    let now = OffsetDateTime::now_utc();
    assert!(info.subscription.period_start <= now && now < info.subscription.period_end);
}

// ============================================================================
// Scenario C/D: soft cancel and reactivation
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn scenario_c_soft_cancel_keeps_access_until_period_end() {
    let (resolver, _pool) = setup().await;
    let user = fresh_user();

    resolver
        .transitions()
        .create_subscription(user, "pro", ActorType::System)
        .await
        .unwrap();
    let cancelled = resolver
        .transitions()
        .cancel_subscription(user, Some("too expensive"), ActorType::User)
        .await
        .unwrap();
    assert!(cancelled.cancel_at_period_end);
    assert_eq!(cancelled.status, SubscriptionStatus::Active);

    // Entitlements keep resolving against the plan until period end
    let decision = resolver.can_use(user, FeatureKey::HdExport).await.unwrap();
    assert!(decision.allowed);
}

#[tokio::test]
#[ignore] // Requires database
async fn scenario_d_reactivate_before_period_end() {
    let (resolver, _pool) = setup().await;
    let user = fresh_user();

    resolver
        .transitions()
        .create_subscription(user, "pro", ActorType::System)
        .await
        .unwrap();
    resolver
        .transitions()
        .cancel_subscription(user, None, ActorType::User)
        .await
        .unwrap();

    let reactivated = resolver
        .transitions()
        .reactivate_subscription(user, ActorType::User)
        .await
        .unwrap();
    assert!(!reactivated.cancel_at_period_end);
    assert_eq!(reactivated.status, SubscriptionStatus::Active);
}

#[tokio::test]
#[ignore] // Requires database
async fn hard_cancel_denies_immediately_but_can_reactivate_in_grace() {
    let (resolver, _pool) = setup().await;
    let user = fresh_user();

    resolver
        .transitions()
        .create_subscription(user, "pro", ActorType::System)
        .await
        .unwrap();
    resolver
        .transitions()
        .cancel_subscription_immediately(user, Some("refund requested"), ActorType::Admin)
        .await
        .unwrap();

    let decision = resolver.can_use(user, FeatureKey::HdExport).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason.as_deref(), Some("subscription is cancelled"));

    // Still inside the paid period, so reactivation is allowed
    let reactivated = resolver
        .transitions()
        .reactivate_subscription(user, ActorType::Admin)
        .await
        .unwrap();
    assert_eq!(reactivated.status, SubscriptionStatus::Active);

    let decision = resolver.can_use(user, FeatureKey::HdExport).await.unwrap();
    assert!(decision.allowed);
}

// ============================================================================
// P5: deterministic denial reasons
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn p5_feature_denial_is_deterministic_and_names_the_plan() {
    let (resolver, _pool) = setup().await;
    let user = fresh_user();

    resolver
        .transitions()
        .create_subscription(user, "starter", ActorType::System)
        .await
        .unwrap();

    let first = resolver
        .can_use(user, FeatureKey::TeamCollaboration)
        .await
        .unwrap();
    let second = resolver
        .can_use(user, FeatureKey::TeamCollaboration)
        .await
        .unwrap();

    assert!(!first.allowed);
    assert!(first.reason.as_deref().unwrap().contains("Starter"));
    assert_eq!(first.reason, second.reason);
}

// ============================================================================
// Audit trail and validation errors
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn transitions_append_one_event_each() {
    let (resolver, pool) = setup().await;
    let user = fresh_user();
    let events = SubscriptionEventLog::new(pool.clone());

    resolver
        .transitions()
        .create_subscription(user, "starter", ActorType::System)
        .await
        .unwrap();
    resolver
        .transitions()
        .change_plan(user, "business", ActorType::PaymentGateway)
        .await
        .unwrap();
    resolver
        .transitions()
        .change_plan(user, "pro", ActorType::User)
        .await
        .unwrap();
    resolver
        .transitions()
        .cancel_subscription(user, None, ActorType::User)
        .await
        .unwrap();
    resolver
        .transitions()
        .reactivate_subscription(user, ActorType::User)
        .await
        .unwrap();

    let log = events.events_for_user(user, 10).await.unwrap();
    let types: Vec<&str> = log.iter().map(|e| e.event_type.as_str()).collect();
    // Newest first
    assert_eq!(
        types,
        vec!["reactivated", "cancelled", "downgraded", "upgraded", "created"]
    );
}

#[tokio::test]
#[ignore] // Requires database
async fn validation_and_not_found_errors() {
    let (resolver, _pool) = setup().await;
    let user = fresh_user();

    // Unknown plan slug
    let err = resolver
        .transitions()
        .create_subscription(user, "enterprise", ActorType::System)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::PlanNotFound(_)));

    // Plan change without a subscription is not-found, not a denial
    let err = resolver
        .transitions()
        .change_plan(user, "pro", ActorType::User)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::SubscriptionNotFound(_)));

    resolver
        .transitions()
        .create_subscription(user, "starter", ActorType::System)
        .await
        .unwrap();

    // Zero amounts are invalid input, not a quota denial
    let err = resolver
        .record_usage(user, ResourceKey::Transformations, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidInput(_)));

    // Changing to the current plan is rejected
    let err = resolver
        .transitions()
        .change_plan(user, "starter", ActorType::User)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidInput(_)));

    // Reactivating a live subscription is an invalid transition
    let err = resolver
        .transitions()
        .reactivate_subscription(user, ActorType::User)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition(_)));

    // Second create for the same user conflicts
    let err = resolver
        .transitions()
        .create_subscription(user, "pro", ActorType::System)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::AlreadyExists(_)));
}

#[tokio::test]
#[ignore] // Requires database
async fn no_subscription_denies_without_error() {
    let (resolver, _pool) = setup().await;
    let user = fresh_user();

    let decision = resolver.can_use(user, FeatureKey::HdExport).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason.as_deref(), Some("no active subscription"));

    let consume = resolver
        .can_consume(user, ResourceKey::Transformations, 1)
        .await
        .unwrap();
    assert!(!consume.allowed);
    assert_eq!(consume.reason.as_deref(), Some("no active subscription"));

    assert!(resolver.user_plan_info(user).await.unwrap().is_none());
}

#[tokio::test]
#[ignore] // Requires database
async fn invariants_hold_after_lifecycle_churn() {
    let (resolver, pool) = setup().await;
    let user = fresh_user();

    resolver
        .transitions()
        .create_subscription(user, "starter", ActorType::System)
        .await
        .unwrap();
    resolver
        .record_usage(user, ResourceKey::ShoppingLists, 2)
        .await
        .unwrap();
    resolver
        .transitions()
        .change_plan(user, "pro", ActorType::PaymentGateway)
        .await
        .unwrap();
    resolver
        .transitions()
        .cancel_subscription(user, None, ActorType::User)
        .await
        .unwrap();

    let summary = roomlift_billing::check_all(&pool).await.unwrap();
    assert_eq!(summary.checks_run, 6);
    assert!(summary.healthy, "violations: {:?}", summary.violations);
}

#[tokio::test]
#[ignore] // Requires database
async fn counters_without_a_subscription_are_flagged() {
    let (_resolver, pool) = setup().await;
    let user = fresh_user();

    // A counter row with no subscription behind it can only appear if a
    // write bypassed the resolver's gating
    sqlx::query(
        r#"
        INSERT INTO usage_counters (
            id, user_id, resource_key, count, period_start, period_end
        ) VALUES ($1, $2, 'transformations', 1, NOW(), NOW() + INTERVAL '30 days')
        "#,
    )
    .bind(uuid::Uuid::new_v4())
    .bind(user.0)
    .execute(&pool)
    .await
    .unwrap();

    let summary = roomlift_billing::check_all(&pool).await.unwrap();
    assert!(!summary.healthy);
    assert!(summary.violations.iter().any(|v| {
        v.invariant == "counters_have_subscriptions" && v.user_ids.contains(&user.0)
    }));

    // Remove the planted row so other checks over this database stay clean
    sqlx::query("DELETE FROM usage_counters WHERE user_id = $1")
        .bind(user.0)
        .execute(&pool)
        .await
        .unwrap();
}
