//! Engine and database configuration, read from the environment.
//!
//! | Variable | Default |
//! |---|---|
//! | `COOPSTOCK_PAGE_SIZE` | 50 |
//! | `COOPSTOCK_MAX_PAGE_SIZE` | 200 |
//! | `COOPSTOCK_RETRY_ATTEMPTS` | 3 |
//! | `COOPSTOCK_RETRY_BASE_MS` | 25 |
//! | `COOPSTOCK_WAREHOUSE_MODE` | `independent` |
//! | `DATABASE_URL` | required for Postgres |
//! | `DATABASE_MAX_CONNECTIONS` | 10 |
//!
//! Unparseable values fall back to the default with a warning.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tracing::warn;

use crate::query::Pagination;
use crate::retry::RetryPolicy;

/// How warehouse sub-stock relates to the movement ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarehouseMode {
    /// Direct absolute writes, no movement history.
    #[default]
    Independent,
    /// Every change of a warehouse's product total is also recorded as a
    /// warehouse-level movement in the same commit.
    Ledgered,
}

impl FromStr for WarehouseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "independent" => Ok(WarehouseMode::Independent),
            "ledgered" => Ok(WarehouseMode::Ledgered),
            other => Err(format!("unknown warehouse mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub retry: RetryPolicy,
    pub warehouse_mode: WarehouseMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 200,
            retry: RetryPolicy::default(),
            warehouse_mode: WarehouseMode::Independent,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let default_page_size = parse_or("COOPSTOCK_PAGE_SIZE", &lookup, defaults.default_page_size);
        let max_page_size = parse_or("COOPSTOCK_MAX_PAGE_SIZE", &lookup, defaults.max_page_size).max(1);
        let attempts = parse_or("COOPSTOCK_RETRY_ATTEMPTS", &lookup, defaults.retry.max_attempts);
        let base_ms = parse_or("COOPSTOCK_RETRY_BASE_MS", &lookup, 25u64);
        let warehouse_mode = parse_or("COOPSTOCK_WAREHOUSE_MODE", &lookup, defaults.warehouse_mode);

        Self {
            default_page_size: default_page_size.clamp(1, max_page_size),
            max_page_size,
            retry: RetryPolicy::exponential(
                attempts,
                Duration::from_millis(base_ms),
                defaults.retry.max_delay,
            ),
            warehouse_mode,
        }
    }

    /// Apply the configured default and cap to a caller's pagination.
    pub fn paginate(&self, pagination: Option<Pagination>) -> Pagination {
        let p = pagination.unwrap_or(Pagination {
            limit: self.default_page_size,
            offset: 0,
        });
        Pagination {
            limit: p.limit.clamp(1, self.max_page_size),
            offset: p.offset,
        }
    }
}

fn parse_or<T>(key: &str, lookup: &impl Fn(&str) -> Option<String>, default: T) -> T
where
    T: FromStr,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "invalid configuration value, using default");
                default
            }
        },
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnvVar(&'static str),

    #[error("database connection failed: {0}")]
    Connect(#[from] sqlx::Error),
}

/// Postgres connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = lookup("DATABASE_URL")
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::MissingEnvVar("DATABASE_URL"))?;
        let max_connections = parse_or("DATABASE_MAX_CONNECTIONS", &lookup, 10u32).max(1);
        Ok(Self {
            url,
            max_connections,
        })
    }

    pub async fn connect(&self) -> Result<PgPool, ConfigError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&self.url)
            .await?;
        Ok(pool)
    }
}
