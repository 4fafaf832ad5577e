//! Common types used across Roomlift

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Plan ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for PlanId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Plan tier for billing
///
/// Tiers are totally ordered by [`PlanTier::rank`]: Starter < Pro < Business.
/// A higher tier must never carry a stricter limit than a lower one (checked
/// in tests against the built-in catalog).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Starter,
    Pro,
    Business,
}

impl Default for PlanTier {
    fn default() -> Self {
        Self::Starter
    }
}

impl PlanTier {
    /// Ordering rank (higher = more capable), monotonic with price
    pub fn rank(&self) -> u8 {
        match self {
            Self::Starter => 0,
            Self::Pro => 1,
            Self::Business => 2,
        }
    }

    pub fn all() -> [PlanTier; 3] {
        [Self::Starter, Self::Pro, Self::Business]
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starter => write!(f, "starter"),
            Self::Pro => write!(f, "pro"),
            Self::Business => write!(f, "business"),
        }
    }
}

impl std::str::FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starter" => Ok(Self::Starter),
            "pro" => Ok(Self::Pro),
            "business" => Ok(Self::Business),
            _ => Err(format!("Invalid plan tier: {}", s)),
        }
    }
}

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Cancelled,
    Incomplete,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl SubscriptionStatus {
    /// Whether this status grants access to plan features
    /// Only active and trialing subscriptions are entitled
    pub fn is_entitled(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    /// Whether this status permits a plan change
    /// Cancelled is terminal for plan changes (reactivate first)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Trialing => write!(f, "trialing"),
            Self::PastDue => write!(f, "past_due"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Incomplete => write!(f, "incomplete"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "past_due" => Ok(Self::PastDue),
            "cancelled" => Ok(Self::Cancelled),
            "incomplete" => Ok(Self::Incomplete),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

// =============================================================================
// Feature and Resource Keys
// =============================================================================

/// Boolean plan capabilities
///
/// This is a closed set on purpose: every key a caller can gate on is an enum
/// variant, so a typo'd key is a compile error instead of a silent deny.
/// Adding a capability means adding a variant here plus a field on
/// [`FeatureSet`]; the compiler then points at every match that must learn
/// about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKey {
    /// Full-resolution exports of transformed rooms
    HdExport,
    /// User-supplied style prompts beyond the preset gallery
    CustomStyles,
    /// Exports without the Roomlift watermark
    WatermarkFree,
    /// Generation jobs jump the shared queue
    PriorityProcessing,
    /// Shared workspaces and invites
    TeamCollaboration,
    /// Programmatic API access
    ApiAccess,
}

impl FeatureKey {
    pub fn all() -> [FeatureKey; 6] {
        [
            Self::HdExport,
            Self::CustomStyles,
            Self::WatermarkFree,
            Self::PriorityProcessing,
            Self::TeamCollaboration,
            Self::ApiAccess,
        ]
    }
}

impl std::fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HdExport => write!(f, "hd_export"),
            Self::CustomStyles => write!(f, "custom_styles"),
            Self::WatermarkFree => write!(f, "watermark_free"),
            Self::PriorityProcessing => write!(f, "priority_processing"),
            Self::TeamCollaboration => write!(f, "team_collaboration"),
            Self::ApiAccess => write!(f, "api_access"),
        }
    }
}

impl std::str::FromStr for FeatureKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hd_export" => Ok(Self::HdExport),
            "custom_styles" => Ok(Self::CustomStyles),
            "watermark_free" => Ok(Self::WatermarkFree),
            "priority_processing" => Ok(Self::PriorityProcessing),
            "team_collaboration" => Ok(Self::TeamCollaboration),
            "api_access" => Ok(Self::ApiAccess),
            _ => Err(format!("Invalid feature key: {}", s)),
        }
    }
}

/// Metered resources with per-period quotas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResourceKey {
    /// AI style transformations of a room photo
    Transformations,
    /// Room type/layout detections
    RoomDetections,
    /// Shopping-list extractions from a styled room
    ShoppingLists,
}

impl ResourceKey {
    pub fn all() -> [ResourceKey; 3] {
        [
            Self::Transformations,
            Self::RoomDetections,
            Self::ShoppingLists,
        ]
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transformations => write!(f, "transformations"),
            Self::RoomDetections => write!(f, "room_detections"),
            Self::ShoppingLists => write!(f, "shopping_lists"),
        }
    }
}

impl std::str::FromStr for ResourceKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "transformations" => Ok(Self::Transformations),
            "room_detections" => Ok(Self::RoomDetections),
            "shopping_lists" => Ok(Self::ShoppingLists),
            _ => Err(format!("Invalid resource key: {}", s)),
        }
    }
}

// =============================================================================
// Quotas
// =============================================================================

/// Per-period quota for a metered resource
///
/// Stored in Postgres as a nullable BIGINT where NULL means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quota {
    Limited(i64),
    Unlimited,
}

impl Quota {
    /// Build from the nullable database column
    pub fn from_column(limit: Option<i64>) -> Self {
        match limit {
            Some(n) => Self::Limited(n),
            None => Self::Unlimited,
        }
    }

    /// Value for the nullable database column
    pub fn to_column(&self) -> Option<i64> {
        match self {
            Self::Limited(n) => Some(*n),
            Self::Unlimited => None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    /// Units left given current usage; None when unlimited
    pub fn remaining(&self, used: i64) -> Option<i64> {
        match self {
            Self::Limited(limit) => Some((limit - used).max(0)),
            Self::Unlimited => None,
        }
    }

    /// Whether consuming `amount` more units stays within the quota
    pub fn allows(&self, used: i64, amount: i64) -> bool {
        match self {
            Self::Limited(limit) => used + amount <= *limit,
            Self::Unlimited => true,
        }
    }
}

impl std::fmt::Display for Quota {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{}", n),
            Self::Unlimited => write!(f, "unlimited"),
        }
    }
}

// =============================================================================
// Feature and Limit Sets
// =============================================================================

/// Boolean capabilities of a plan, one field per [`FeatureKey`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub hd_export: bool,
    pub custom_styles: bool,
    pub watermark_free: bool,
    pub priority_processing: bool,
    pub team_collaboration: bool,
    pub api_access: bool,
}

impl FeatureSet {
    /// Default capabilities for a tier
    pub fn for_tier(tier: PlanTier) -> Self {
        match tier {
            PlanTier::Starter => Self {
                hd_export: false,
                custom_styles: false,
                watermark_free: false,
                priority_processing: false,
                team_collaboration: false,
                api_access: true,
            },
            PlanTier::Pro => Self {
                hd_export: true,
                custom_styles: true,
                watermark_free: true,
                priority_processing: false,
                team_collaboration: false,
                api_access: true,
            },
            PlanTier::Business => Self {
                hd_export: true,
                custom_styles: true,
                watermark_free: true,
                priority_processing: true,
                team_collaboration: true,
                api_access: true,
            },
        }
    }

    pub fn has(&self, key: FeatureKey) -> bool {
        match key {
            FeatureKey::HdExport => self.hd_export,
            FeatureKey::CustomStyles => self.custom_styles,
            FeatureKey::WatermarkFree => self.watermark_free,
            FeatureKey::PriorityProcessing => self.priority_processing,
            FeatureKey::TeamCollaboration => self.team_collaboration,
            FeatureKey::ApiAccess => self.api_access,
        }
    }
}

/// Per-period quotas of a plan, one field per [`ResourceKey`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSet {
    pub transformations: Quota,
    pub room_detections: Quota,
    pub shopping_lists: Quota,
}

impl LimitSet {
    /// Default quotas for a tier
    /// Starter (5/10/5) → Pro (unlimited/500/200) → Business (unlimited)
    pub fn for_tier(tier: PlanTier) -> Self {
        match tier {
            PlanTier::Starter => Self {
                transformations: Quota::Limited(5),
                room_detections: Quota::Limited(10),
                shopping_lists: Quota::Limited(5),
            },
            PlanTier::Pro => Self {
                transformations: Quota::Unlimited,
                room_detections: Quota::Limited(500),
                shopping_lists: Quota::Limited(200),
            },
            PlanTier::Business => Self {
                transformations: Quota::Unlimited,
                room_detections: Quota::Unlimited,
                shopping_lists: Quota::Unlimited,
            },
        }
    }

    pub fn get(&self, key: ResourceKey) -> Quota {
        match key {
            ResourceKey::Transformations => self.transformations,
            ResourceKey::RoomDetections => self.room_detections,
            ResourceKey::ShoppingLists => self.shopping_lists,
        }
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// Subscription model, exactly one row per user
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub trial_end: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Usage counter model, one row per (user, resource, period)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageCounter {
    pub id: Uuid,
    pub user_id: Uuid,
    pub resource_key: ResourceKey,
    pub count: i64,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

/// Subscription event model, an append-only audit trail
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub event_type: String,
    pub from_plan_id: Option<Uuid>,
    pub to_plan_id: Option<Uuid>,
    pub actor_type: String,
    pub reason: Option<String>,
    pub detail: serde_json::Value,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Tests
// =============================================================================
