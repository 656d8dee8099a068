//! Per-domain politeness state shared by the whole fleet.
//!
//! Workers are separate processes, so this state lives in the shared
//! store. Updates are deliberately last-write-wins: small timing
//! imprecision is acceptable for a politeness heuristic.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct DomainRateState {
    pub domain: String,
    pub last_request_at: Option<DateTime<Utc>>,
    /// Crawl-delay from robots, cached once discovered.
    pub crawl_delay_secs: Option<f64>,
    /// Floor on the next request time, from a Retry-After signal.
    pub min_next_request_at: Option<DateTime<Utc>>,
    pub quarantine_until: Option<DateTime<Utc>>,
    pub quarantine_reason: Option<String>,
    pub consecutive_block_count: i32,
    pub last_block_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DomainRateState {
    /// Fresh state for a domain the fleet has never touched.
    pub fn fresh(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            last_request_at: None,
            crawl_delay_secs: None,
            min_next_request_at: None,
            quarantine_until: None,
            quarantine_reason: None,
            consecutive_block_count: 0,
            last_block_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether the domain is quarantined as of `now`.
    pub fn quarantined_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.quarantine_until.filter(|until| *until > now)
    }

    pub async fn fetch(pool: &PgPool, domain: &str) -> Result<Option<Self>> {
        let state = sqlx::query_as::<_, Self>(
            "SELECT * FROM domain_rate_states WHERE domain = $1",
        )
        .bind(domain)
        .fetch_optional(pool)
        .await?;
        Ok(state)
    }

    /// Record that a request was just dispatched to the domain.
    pub async fn touch_request(pool: &PgPool, domain: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO domain_rate_states (domain, last_request_at)
            VALUES ($1, NOW())
            ON CONFLICT (domain) DO UPDATE
                SET last_request_at = NOW(), updated_at = NOW()
            "#,
        )
        .bind(domain)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Cache the robots crawl-delay (or its confirmed absence).
    pub async fn set_crawl_delay(pool: &PgPool, domain: &str, secs: Option<f64>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO domain_rate_states (domain, crawl_delay_secs)
            VALUES ($1, $2)
            ON CONFLICT (domain) DO UPDATE
                SET crawl_delay_secs = EXCLUDED.crawl_delay_secs, updated_at = NOW()
            "#,
        )
        .bind(domain)
        .bind(secs)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Apply a Retry-After floor. The floor only moves forward.
    pub async fn apply_retry_after(
        pool: &PgPool,
        domain: &str,
        until: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO domain_rate_states (domain, min_next_request_at)
            VALUES ($1, $2)
            ON CONFLICT (domain) DO UPDATE
                SET min_next_request_at = GREATEST(domain_rate_states.min_next_request_at, EXCLUDED.min_next_request_at),
                    updated_at = NOW()
            "#,
        )
        .bind(domain)
        .bind(until)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Record a block event: the counter and window are computed by the
    /// caller from the quarantine schedule.
    pub async fn record_block(
        pool: &PgPool,
        domain: &str,
        consecutive_blocks: i32,
        until: DateTime<Utc>,
        reason: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO domain_rate_states
                (domain, consecutive_block_count, quarantine_until, quarantine_reason, last_block_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (domain) DO UPDATE
                SET consecutive_block_count = EXCLUDED.consecutive_block_count,
                    quarantine_until = EXCLUDED.quarantine_until,
                    quarantine_reason = EXCLUDED.quarantine_reason,
                    last_block_at = NOW(),
                    updated_at = NOW()
            "#,
        )
        .bind(domain)
        .bind(consecutive_blocks)
        .bind(until)
        .bind(reason)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Operator action: clear the block ladder for a domain.
    pub async fn reset_blocks(pool: &PgPool, domain: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE domain_rate_states
            SET consecutive_block_count = 0,
                quarantine_until = NULL,
                quarantine_reason = NULL,
                updated_at = NOW()
            WHERE domain = $1
            "#,
        )
        .bind(domain)
        .execute(pool)
        .await?;
        Ok(())
    }
}

/// Normalize a URL or bare host to the domain key used for rate state.
pub fn normalize_domain(input: &str) -> Result<String> {
    if let Ok(url) = url::Url::parse(input) {
        if let Some(host) = url.host_str() {
            return Ok(host.to_ascii_lowercase());
        }
    }
    let host = input
        .trim()
        .trim_end_matches('/')
        .rsplit("://")
        .next()
        .unwrap_or(input)
        .split('/')
        .next()
        .unwrap_or(input);
    if host.is_empty() {
        anyhow::bail!("no host in {input:?}");
    }
    Ok(host.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn fresh_state_is_unquarantined() {
        let state = DomainRateState::fresh("example.com");
        assert!(state.quarantined_at(Utc::now()).is_none());
        assert_eq!(state.consecutive_block_count, 0);
    }

    #[test]
    fn quarantine_is_time_boxed() {
        let mut state = DomainRateState::fresh("example.com");
        let now = Utc::now();
        state.quarantine_until = Some(now + Duration::hours(1));

        assert!(state.quarantined_at(now).is_some());
        assert!(state.quarantined_at(now + Duration::hours(2)).is_none());
    }

    #[test]
    fn normalize_strips_scheme_and_path() {
        assert_eq!(
            normalize_domain("https://Example.COM/search?q=x").unwrap(),
            "example.com"
        );
        assert_eq!(normalize_domain("example.com").unwrap(), "example.com");
        assert_eq!(normalize_domain("example.com/path").unwrap(), "example.com");
    }

    #[test]
    fn normalize_rejects_empty_input() {
        assert!(normalize_domain("").is_err());
    }
}
