// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Roomlift Entitlement Module
//!
//! Determines, for a given user and feature or resource, whether an action is
//! allowed right now, and keeps a race-safe count of consumption against the
//! plan's quota over a billing period.
//!
//! ## Features
//!
//! - **Plan Catalog**: built-in Starter/Pro/Business tiers merged with
//!   persisted overrides
//! - **Subscription Store**: one upserted record per user with period bounds
//!   and lifecycle status
//! - **Usage Ledger**: atomic per-period counters with hard quota enforcement
//! - **Entitlement Resolver**: allow/deny decisions with structured reasons
//! - **Plan Transitions**: create, upgrade, downgrade, cancel, reactivate
//! - **Event Log**: append-only audit trail of every transition
//!
//! ## Quota policy
//!
//! Limits are hard. `record_usage` is a single atomic increment-if-under-limit
//! statement, so the check-then-act gap between a permission check and the
//! metered action cannot over-consume a quota. `can_consume` remains a pure
//! read for UI and middleware pre-checks.

pub mod catalog;
pub mod error;
pub mod events;
pub mod invariants;
pub mod ledger;
pub mod resolver;
pub mod subscriptions;
pub mod transitions;

pub use catalog::{Plan, PlanCatalog};
pub use error::{BillingError, BillingResult};
pub use events::{ActorType, EventRecord, SubscriptionEventLog, SubscriptionEventType};
pub use invariants::{
    check_all, check_tier_monotonicity, InvariantCheckSummary, InvariantViolation,
    ViolationSeverity,
};
pub use ledger::{UsageLedger, UsageSnapshot};
pub use resolver::{ConsumeDecision, Decision, EntitlementResolver, ResourceUsage, UserPlanInfo};
pub use subscriptions::SubscriptionStore;
pub use transitions::{PlanChangeDirection, PlanTransitionManager};
