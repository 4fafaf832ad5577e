// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Roomlift Shared Types and Utilities
//!
//! This crate contains the typed billing vocabulary (plan tiers, feature and
//! resource keys, quotas) plus database and configuration helpers shared
//! across the Roomlift platform.

pub mod config;
pub mod db;
pub mod types;

pub use config::{Config, ConfigError};
pub use db::*;
pub use types::*;
