use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{anyhow, Context};

use crate::conversations::IdScheme;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub db_max_connections: u32,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window: Duration,
    pub retention: Duration,
    pub retention_sweep: Duration,
    pub id_scheme: IdScheme,
    pub rust_log: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: "sqlite://relay.db?mode=rwc".to_owned(),
            db_max_connections: 16,
            rate_limit_max_requests: 30,
            rate_limit_window: Duration::from_secs(5),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            retention_sweep: Duration::from_secs(60 * 60),
            id_scheme: IdScheme::Opaque,
            rust_log: "info".to_owned(),
        }
    }
}

impl Config {
    /// Reads the process environment, after loading `.env` if one exists.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let retention_days: u64 = parse_or(&lookup, "RETENTION_DAYS", 30)?;
        let window_secs: u64 = parse_or(&lookup, "RATE_LIMIT_WINDOW_SECS", defaults.rate_limit_window.as_secs())?;
        let retention_secs = retention_days
            .checked_mul(24 * 60 * 60)
            .with_context(|| format!("invalid RETENTION_DAYS: {retention_days} days overflows"))?;
        let sweep_secs: u64 = parse_or(&lookup, "RETENTION_SWEEP_SECS", defaults.retention_sweep.as_secs())?;

        Ok(Self {
            bind_addr: parse_or(&lookup, "BIND_ADDR", defaults.bind_addr)?,
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            rate_limit_max_requests: parse_or(&lookup, "RATE_LIMIT_MAX_REQUESTS", defaults.rate_limit_max_requests)?,
            rate_limit_window: Duration::from_secs(window_secs),
            retention: Duration::from_secs(retention_secs),
            retention_sweep: Duration::from_secs(sweep_secs.max(1)),
            id_scheme: parse_or(&lookup, "CONV_ID_SCHEME", defaults.id_scheme)?,
            rust_log: lookup("RUST_LOG").unwrap_or(defaults.rust_log),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("invalid {key}: {raw:?}")),
    }
}
