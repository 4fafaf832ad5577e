//! Plan Catalog
//!
//! Read-only lookup of plan definitions. Three built-in plans (Starter, Pro,
//! Business) ship with the binary; rows in the `plans` table override them
//! per slug, so pricing experiments do not need a deploy. The persisted
//! catalog is authoritative; the in-memory cache exists only to keep hot
//! entitlement checks off the database and is dropped on `invalidate()`.
//!
//! Lookups never fail for an unknown plan; absence is `None`, not an error.

use std::collections::HashMap;

use roomlift_shared::{FeatureSet, LimitSet, PlanId, PlanTier};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::BillingResult;

/// A plan catalog entry, immutable per version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub slug: String,
    pub name: String,
    pub tier: PlanTier,
    pub features: FeatureSet,
    pub limits: LimitSet,
}

impl Plan {
    /// Built-in definition for a tier
    ///
    /// IDs are fixed UUIDs so that subscriptions created against a built-in
    /// plan stay valid when the same slug is later persisted.
    pub fn builtin(tier: PlanTier) -> Self {
        let (id, slug, name) = match tier {
            PlanTier::Starter => (
                Uuid::from_u128(0x524c_0001_0000_0000_0000_0000_0000_0001),
                "starter",
                "Starter",
            ),
            PlanTier::Pro => (
                Uuid::from_u128(0x524c_0001_0000_0000_0000_0000_0000_0002),
                "pro",
                "Pro",
            ),
            PlanTier::Business => (
                Uuid::from_u128(0x524c_0001_0000_0000_0000_0000_0000_0003),
                "business",
                "Business",
            ),
        };
        Self {
            id: PlanId(id),
            slug: slug.to_string(),
            name: name.to_string(),
            tier,
            features: FeatureSet::for_tier(tier),
            limits: LimitSet::for_tier(tier),
        }
    }
}

/// Row shape of the `plans` table
#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    slug: String,
    name: String,
    tier: i32,
    limit_transformations: Option<i64>,
    limit_room_detections: Option<i64>,
    limit_shopping_lists: Option<i64>,
    feature_hd_export: bool,
    feature_custom_styles: bool,
    feature_watermark_free: bool,
    feature_priority_processing: bool,
    feature_team_collaboration: bool,
    feature_api_access: bool,
}

impl PlanRow {
    fn into_plan(self) -> Option<Plan> {
        // Rows with a tier outside the known set are skipped rather than
        // guessed at; the built-in plan for that slug (if any) still applies.
        let tier = match self.tier {
            0 => PlanTier::Starter,
            1 => PlanTier::Pro,
            2 => PlanTier::Business,
            _ => return None,
        };
        Some(Plan {
            id: PlanId(self.id),
            slug: self.slug,
            name: self.name,
            tier,
            features: FeatureSet {
                hd_export: self.feature_hd_export,
                custom_styles: self.feature_custom_styles,
                watermark_free: self.feature_watermark_free,
                priority_processing: self.feature_priority_processing,
                team_collaboration: self.feature_team_collaboration,
                api_access: self.feature_api_access,
            },
            limits: LimitSet {
                transformations: roomlift_shared::Quota::from_column(self.limit_transformations),
                room_detections: roomlift_shared::Quota::from_column(self.limit_room_detections),
                shopping_lists: roomlift_shared::Quota::from_column(self.limit_shopping_lists),
            },
        })
    }
}

/// Plan catalog service
pub struct PlanCatalog {
    pool: Option<PgPool>,
    cache: RwLock<Option<Vec<Plan>>>,
}

impl PlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Some(pool),
            cache: RwLock::new(None),
        }
    }

    /// Catalog backed only by the built-in defaults (no database)
    pub fn builtin() -> Self {
        Self {
            pool: None,
            cache: RwLock::new(Some(Self::builtin_plans())),
        }
    }

    /// Catalog over a fixed plan list, standing in for a merged load
    #[cfg(test)]
    fn with_plans(plans: Vec<Plan>) -> Self {
        Self {
            pool: None,
            cache: RwLock::new(Some(plans)),
        }
    }

    fn builtin_plans() -> Vec<Plan> {
        PlanTier::all().into_iter().map(Plan::builtin).collect()
    }

    /// Drop the cached catalog; the next lookup reloads from the database
    pub async fn invalidate(&self) {
        if self.pool.is_some() {
            *self.cache.write().await = None;
        }
    }

    /// Look up a plan by ID
    ///
    /// Falls back to the built-in definitions when the merged catalog has no
    /// match: a persisted override may replace a built-in slug under a new
    /// UUID, and subscriptions created against the built-in ID must keep
    /// resolving.
    pub async fn plan(&self, id: PlanId) -> BillingResult<Option<Plan>> {
        let plans = self.load().await?;
        if let Some(plan) = plans.into_iter().find(|p| p.id == id) {
            return Ok(Some(plan));
        }
        Ok(Self::builtin_plans().into_iter().find(|p| p.id == id))
    }

    /// Look up a plan by slug
    pub async fn plan_by_slug(&self, slug: &str) -> BillingResult<Option<Plan>> {
        let plans = self.load().await?;
        Ok(plans.into_iter().find(|p| p.slug == slug))
    }

    /// All plans, ordered by tier ascending
    pub async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        self.load().await
    }

    async fn load(&self) -> BillingResult<Vec<Plan>> {
        if let Some(plans) = self.cache.read().await.as_ref() {
            return Ok(plans.clone());
        }

        let plans = match &self.pool {
            Some(pool) => Self::merge_persisted(pool).await?,
            None => Self::builtin_plans(),
        };

        let mut cache = self.cache.write().await;
        // Another loader may have raced us here; last write wins and both
        // results came from the same authoritative source.
        *cache = Some(plans.clone());
        Ok(plans)
    }

    /// Built-in defaults overridden by persisted rows, keyed on slug
    async fn merge_persisted(pool: &PgPool) -> BillingResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(
            r#"
            SELECT
                id, slug, name, tier,
                limit_transformations, limit_room_detections, limit_shopping_lists,
                feature_hd_export, feature_custom_styles, feature_watermark_free,
                feature_priority_processing, feature_team_collaboration, feature_api_access
            FROM plans
            ORDER BY tier ASC
            "#,
        )
        .fetch_all(pool)
        .await?;

        let mut by_slug: HashMap<String, Plan> = Self::builtin_plans()
            .into_iter()
            .map(|p| (p.slug.clone(), p))
            .collect();
        for row in rows {
            if let Some(plan) = row.into_plan() {
                by_slug.insert(plan.slug.clone(), plan);
            }
        }

        let mut plans: Vec<Plan> = by_slug.into_values().collect();
        plans.sort_by_key(|p| (p.tier.rank(), p.slug.clone()));
        Ok(plans)
    }
}
