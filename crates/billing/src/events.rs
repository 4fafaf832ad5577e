//! Subscription event log
//!
//! Append-only audit trail of subscription transitions. Events answer "why
//! is this user on this plan?" long after the fact, so rows are never
//! mutated or deleted; one row per transition.

use roomlift_shared::{SubscriptionEvent, UserId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of subscription events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionEventType {
    Created,
    Upgraded,
    Downgraded,
    Cancelled,
    Reactivated,
    PeriodRolled,
}

impl std::fmt::Display for SubscriptionEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Upgraded => "upgraded",
            Self::Downgraded => "downgraded",
            Self::Cancelled => "cancelled",
            Self::Reactivated => "reactivated",
            Self::PeriodRolled => "period_rolled",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through the app
    User,
    /// Admin user
    Admin,
    /// System automation (lazy rollover, signup default)
    System,
    /// Payment gateway confirmation
    PaymentGateway,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Admin => write!(f, "admin"),
            ActorType::System => write!(f, "system"),
            ActorType::PaymentGateway => write!(f, "payment_gateway"),
        }
    }
}

/// A pending event record, built up before insertion
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub user_id: UserId,
    pub subscription_id: Uuid,
    pub event_type: SubscriptionEventType,
    pub from_plan_id: Option<Uuid>,
    pub to_plan_id: Option<Uuid>,
    pub actor_type: ActorType,
    pub reason: Option<String>,
    pub detail: serde_json::Value,
}

impl EventRecord {
    pub fn new(
        user_id: UserId,
        subscription_id: Uuid,
        event_type: SubscriptionEventType,
    ) -> Self {
        Self {
            user_id,
            subscription_id,
            event_type,
            from_plan_id: None,
            to_plan_id: None,
            actor_type: ActorType::System,
            reason: None,
            detail: serde_json::json!({}),
        }
    }

    pub fn plans(mut self, from: Option<Uuid>, to: Option<Uuid>) -> Self {
        self.from_plan_id = from;
        self.to_plan_id = to;
        self
    }

    pub fn actor(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Service for logging and querying subscription events
#[derive(Clone)]
pub struct SubscriptionEventLog {
    pool: PgPool,
}

impl SubscriptionEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one event row
    pub async fn log(&self, record: EventRecord) -> BillingResult<Uuid> {
        let event_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO subscription_events (
                id, user_id, subscription_id, event_type,
                from_plan_id, to_plan_id, actor_type, reason, detail, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.user_id.0)
        .bind(record.subscription_id)
        .bind(record.event_type.to_string())
        .bind(record.from_plan_id)
        .bind(record.to_plan_id)
        .bind(record.actor_type.to_string())
        .bind(&record.reason)
        .bind(&record.detail)
        .fetch_one(&self.pool)
        .await?;

        Ok(event_id.0)
    }

    /// Recent events for a user, newest first
    pub async fn events_for_user(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionEvent>> {
        let events: Vec<SubscriptionEvent> = sqlx::query_as(
            r#"
            SELECT * FROM subscription_events
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// Recent events of one type for a user, newest first
    pub async fn events_by_type(
        &self,
        user_id: UserId,
        event_type: SubscriptionEventType,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionEvent>> {
        let events: Vec<SubscriptionEvent> = sqlx::query_as(
            r#"
            SELECT * FROM subscription_events
            WHERE user_id = $1 AND event_type = $2
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(user_id.0)
        .bind(event_type.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}
