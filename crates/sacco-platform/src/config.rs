use anyhow::{Context, Result};
use rust_decimal::Decimal;

use sacco_core::policy::AllocationPolicy;

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub database_url: String,
    pub redis_url: String,
    pub http_addr: String,
    pub max_db_connections: u32,
}

impl ServiceConfig {
    pub fn from_env(default_http_addr: &str) -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let redis_url = std::env::var("REDIS_URL").context("REDIS_URL is required")?;
        let http_addr =
            std::env::var("HTTP_ADDR").unwrap_or_else(|_| default_http_addr.to_string());
        let max_db_connections = match std::env::var("DB_MAX_CONNECTIONS") {
            Ok(raw) => raw
                .parse::<u32>()
                .with_context(|| format!("DB_MAX_CONNECTIONS must be an integer, got {raw:?}"))?,
            Err(_) => 10,
        };

        Ok(Self {
            database_url,
            redis_url,
            http_addr,
            max_db_connections,
        })
    }
}

/// Allocation policy with optional environment overrides on top of the
/// built-in defaults.
pub fn policy_from_env() -> Result<AllocationPolicy> {
    let mut policy = AllocationPolicy::default();
    if let Some(value) = decimal_var("SHARE_PRICE")? {
        anyhow::ensure!(value > Decimal::ZERO, "SHARE_PRICE must be positive");
        policy.share_price = value;
    }
    if let Some(value) = int_var("MAX_SHARES")? {
        policy.max_shares = value;
    }
    if let Some(value) = decimal_var("MIN_SHARE_CAPITAL")? {
        policy.min_share_capital = value;
    }
    if let Some(value) = decimal_var("WELFARE_AMOUNT")? {
        policy.welfare_amount = value;
    }
    Ok(policy)
}

fn decimal_var(name: &str) -> Result<Option<Decimal>> {
    match std::env::var(name) {
        Ok(raw) => {
            let value = raw
                .parse::<Decimal>()
                .with_context(|| format!("{name} must be a decimal, got {raw:?}"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

fn int_var(name: &str) -> Result<Option<i64>> {
    match std::env::var(name) {
        Ok(raw) => {
            let value = raw
                .parse::<i64>()
                .with_context(|| format!("{name} must be an integer, got {raw:?}"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}
