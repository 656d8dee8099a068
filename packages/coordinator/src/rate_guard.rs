//! Per-domain politeness guard.
//!
//! Combines the pure politeness policies (delay/backoff, quarantine
//! schedule, robots directives) with the fleet-shared
//! [`RateStateStore`]. One guard instance is constructed per process
//! and injected into the worker loop; there is no global state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use politeness::{DelayPolicy, PolitenessError, PolitenessResult, QuarantineSchedule, RobotsReader};
use tracing::{debug, info, warn};

use crate::models::{normalize_domain, DomainRateState};
use crate::store::RateStateStore;

pub struct RateGuard {
    store: Arc<dyn RateStateStore>,
    robots: Arc<dyn RobotsReader>,
    policy: DelayPolicy,
    schedule: QuarantineSchedule,
}

impl RateGuard {
    pub fn new(
        store: Arc<dyn RateStateStore>,
        robots: Arc<dyn RobotsReader>,
        policy: DelayPolicy,
        schedule: QuarantineSchedule,
    ) -> Self {
        Self {
            store,
            robots,
            policy,
            schedule,
        }
    }

    /// Block the calling worker until a request to `domain` is polite,
    /// then record the dispatch.
    ///
    /// Accounts for time already elapsed since the domain's last
    /// request (never over-sleeps) and honors any Retry-After floor.
    /// Returns [`PolitenessError::Quarantined`] without sleeping when
    /// the domain is under quarantine, so the caller can skip rather
    /// than retry-loop.
    pub async fn wait(&self, domain: &str, attempt: u32) -> PolitenessResult<()> {
        let domain = &self.key(domain)?;
        let state = self.load(domain).await?;
        let now = Utc::now();

        if let Some(until) = state.quarantined_at(now) {
            return Err(PolitenessError::Quarantined {
                domain: domain.to_string(),
                until,
                reason: state
                    .quarantine_reason
                    .unwrap_or_else(|| "unspecified".to_string()),
            });
        }

        let crawl_delay = self.crawl_delay(domain, &state).await?;
        let delay = self.policy.delay_for(crawl_delay, attempt);

        // Earliest polite dispatch time: last request plus the computed
        // delay, but never before a server-imposed Retry-After floor.
        let mut earliest = state
            .last_request_at
            .map(|at| at + chrono::Duration::from_std(delay).unwrap_or_default())
            .unwrap_or(now);
        if let Some(floor) = state.min_next_request_at {
            earliest = earliest.max(floor);
        }

        if earliest > now {
            let sleep_for = (earliest - now).to_std().unwrap_or(Duration::ZERO);
            debug!(domain = %domain, sleep_ms = sleep_for.as_millis() as u64, attempt, "politeness wait");
            tokio::time::sleep(sleep_for).await;
        }

        self.store
            .touch_request(domain)
            .await
            .map_err(state_error)?;
        Ok(())
    }

    /// Whether the domain is currently quarantined.
    pub async fn is_quarantined(&self, domain: &str) -> PolitenessResult<Option<DateTime<Utc>>> {
        let state = self.load(&self.key(domain)?).await?;
        Ok(state.quarantined_at(Utc::now()))
    }

    /// Quarantine the domain after a block signal, moving it one tier
    /// up the progressive schedule. Returns the window end.
    pub async fn quarantine(&self, domain: &str, reason: &str) -> PolitenessResult<DateTime<Utc>> {
        let domain = &self.key(domain)?;
        let state = self.load(domain).await?;
        let now = Utc::now();
        let (blocks, until) =
            self.schedule
                .window_end(state.consecutive_block_count.max(0) as u32, state.last_block_at, now);

        self.store
            .record_block(domain, blocks as i32, until, reason)
            .await
            .map_err(state_error)?;

        warn!(
            domain = %domain,
            reason = %reason,
            consecutive_blocks = blocks,
            until = %until,
            "domain quarantined"
        );
        Ok(until)
    }

    /// Apply a Retry-After signal: the next dispatch to the domain
    /// waits at least `retry_after`, whatever the jitter range says.
    pub async fn handle_rate_limit_signal(
        &self,
        domain: &str,
        retry_after: Duration,
    ) -> PolitenessResult<()> {
        let domain = &self.key(domain)?;
        let until = Utc::now() + chrono::Duration::from_std(retry_after).unwrap_or_default();
        self.store
            .apply_retry_after(domain, until)
            .await
            .map_err(state_error)?;
        info!(domain = %domain, retry_after_secs = retry_after.as_secs(), "rate limit signal applied");
        Ok(())
    }

    /// Operator action: clear the block ladder for a domain.
    pub async fn reset_blocks(&self, domain: &str) -> PolitenessResult<()> {
        let domain = &self.key(domain)?;
        self.store.reset_blocks(domain).await.map_err(state_error)?;
        info!(domain = %domain, "block counter reset by operator");
        Ok(())
    }

    /// Normalized rate-state key: mixed-case or URL-form inputs must
    /// not split one domain's politeness state.
    fn key(&self, domain: &str) -> PolitenessResult<String> {
        normalize_domain(domain).map_err(state_error)
    }

    async fn load(&self, domain: &str) -> PolitenessResult<DomainRateState> {
        Ok(self
            .store
            .get(domain)
            .await
            .map_err(state_error)?
            .unwrap_or_else(|| DomainRateState::fresh(domain)))
    }

    /// Robots crawl-delay for the domain, cached in shared state after
    /// the first lookup. Robots fetches fail open.
    async fn crawl_delay(
        &self,
        domain: &str,
        state: &DomainRateState,
    ) -> PolitenessResult<Option<Duration>> {
        if let Some(secs) = state.crawl_delay_secs {
            return Ok(Some(Duration::from_secs_f64(secs)));
        }
        // First contact: one robots lookup, then the cached value wins.
        if state.last_request_at.is_some() {
            return Ok(None);
        }

        let directives = self.robots.directives(domain, "/").await;
        if !directives.allowed {
            return Err(PolitenessError::Disallowed {
                domain: domain.to_string(),
                path: "/".to_string(),
            });
        }
        self.store
            .set_crawl_delay(domain, directives.crawl_delay.map(|d| d.as_secs_f64()))
            .await
            .map_err(state_error)?;
        Ok(directives.crawl_delay)
    }
}

fn state_error(e: anyhow::Error) -> PolitenessError {
    PolitenessError::State(e.into())
}
