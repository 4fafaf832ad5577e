//! Billing error types
//!
//! Business denials (quota exceeded, feature locked, inactive status) are
//! never errors; they come back as decision values from the resolver and
//! ledger. Errors here are invalid input, missing records, and storage
//! failures. Callers gating quota-relevant actions must treat a storage
//! failure as a deny (fail closed).

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("No subscription found for user: {0}")]
    SubscriptionNotFound(uuid::Uuid),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
