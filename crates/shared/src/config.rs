//! Application configuration

use std::env;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {var}: {value}")]
    InvalidVar { var: String, value: String },
}

/// Configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Billing
    /// Slug of the plan assigned on signup
    pub default_plan_slug: String,
    /// Length of one billing/usage period in days
    pub billing_cycle_days: i64,
}

impl Config {
    /// Load configuration from the environment (reads `.env` if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: require("DATABASE_URL")?,
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 3)?,
            default_plan_slug: env::var("DEFAULT_PLAN_SLUG").unwrap_or_else(|_| "starter".into()),
            billing_cycle_days: validate_cycle_days(parse_or("BILLING_CYCLE_DAYS", 30)?)?,
        })
    }
}

/// A billing cycle must be at least one day, or period rollover can never
/// advance past an elapsed period
fn validate_cycle_days(days: i64) -> Result<i64, ConfigError> {
    if days < 1 {
        return Err(ConfigError::InvalidVar {
            var: "BILLING_CYCLE_DAYS".to_string(),
            value: days.to_string(),
        });
    }
    Ok(days)
}

fn require(var: &str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::MissingVar(var.to_string()))
}

fn parse_or<T: std::str::FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidVar {
            var: var.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_or_uses_default_when_unset() {
        let days: i64 = parse_or("ROOMLIFT_TEST_UNSET_VAR", 30).unwrap();
        assert_eq!(days, 30);
    }

    #[test]
    fn test_cycle_days_must_be_positive() {
        assert_eq!(validate_cycle_days(1).unwrap(), 1);
        assert_eq!(validate_cycle_days(30).unwrap(), 30);
        assert!(matches!(
            validate_cycle_days(0),
            Err(ConfigError::InvalidVar { .. })
        ));
        assert!(matches!(
            validate_cycle_days(-7),
            Err(ConfigError::InvalidVar { .. })
        ));
    }
}
