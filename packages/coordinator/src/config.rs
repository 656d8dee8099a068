use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub user_agent: String,
    pub min_request_delay: Duration,
    pub max_request_delay: Duration,
    pub max_backoff: Duration,
    pub orphan_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            user_agent: env::var("CRAWLER_USER_AGENT")
                .unwrap_or_else(|_| "coordinator-fleet/1.0".to_string()),
            min_request_delay: env_secs("MIN_REQUEST_DELAY_SECS", 2)?,
            max_request_delay: env_secs("MAX_REQUEST_DELAY_SECS", 6)?,
            max_backoff: env_secs("MAX_BACKOFF_SECS", 120)?,
            orphan_timeout: env_secs("ORPHAN_TIMEOUT_SECS", 15 * 60)?,
            heartbeat_interval: env_secs("HEARTBEAT_INTERVAL_SECS", 30)?,
        })
    }
}

fn env_secs(name: &str, default: u64) -> Result<Duration> {
    let secs = match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} must be a number of seconds", name))?,
        Err(_) => default,
    };
    Ok(Duration::from_secs(secs))
}
