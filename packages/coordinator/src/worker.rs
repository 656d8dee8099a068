//! State-partitioned crawl worker runtime loop.
//!
//! One OS process per worker; each process runs this single loop plus
//! the heartbeat reporter. All cross-process coordination goes through
//! the job store's claim protocol; there is no in-memory coordination
//! between workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use politeness::PolitenessError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::{ExecutionReport, JobExecutor};
use crate::models::{CrawlJob, JobOutcome};
use crate::rate_guard::RateGuard;
use crate::refresh::RefreshPolicy;
use crate::reporter::WorkerStats;
use crate::service::Service;
use crate::store::JobStore;

/// Exponential idle backoff: grows on every empty cycle, resets as
/// soon as work is found.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    start: Duration,
    factor: f64,
    cap: Duration,
    current: Duration,
}

impl IdleBackoff {
    pub fn new(start: Duration, factor: f64, cap: Duration) -> Self {
        Self {
            start,
            factor,
            cap,
            current: start,
        }
    }

    /// Current sleep, advancing the backoff for the next empty cycle.
    pub fn next_sleep(&mut self) -> Duration {
        let sleep = self.current;
        self.current = Duration::from_secs_f64(self.current.as_secs_f64() * self.factor).min(self.cap);
        sleep
    }

    pub fn reset(&mut self) {
        self.current = self.start;
    }
}

impl Default for IdleBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), 1.5, Duration::from_secs(300))
    }
}

#[derive(Debug, Clone)]
pub struct CrawlWorkerConfig {
    pub worker_name: String,
    /// Static, non-overlapping partition assignment for this process.
    pub shard: Vec<String>,
    pub batch_size: i64,
    /// Must exceed max plausible job duration plus heartbeat interval.
    pub orphan_timeout: Duration,
    pub job_heartbeat_interval: Duration,
    /// Randomized pause between jobs, inclusive range.
    pub inter_job_delay: (Duration, Duration),
    pub idle_backoff: IdleBackoff,
    /// Periodic orphan sweep + due-again requeue.
    pub maintenance_interval: Duration,
}

impl CrawlWorkerConfig {
    pub fn new(worker_name: impl Into<String>, shard: Vec<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
            shard,
            batch_size: 5,
            orphan_timeout: Duration::from_secs(15 * 60),
            job_heartbeat_interval: Duration::from_secs(30),
            inter_job_delay: (Duration::from_secs(2), Duration::from_secs(8)),
            idle_backoff: IdleBackoff::default(),
            maintenance_interval: Duration::from_secs(5 * 60),
        }
    }
}

pub struct CrawlWorker {
    store: Arc<dyn JobStore>,
    rate: Arc<RateGuard>,
    executor: Arc<dyn JobExecutor>,
    stats: WorkerStats,
    policy: RefreshPolicy,
    config: CrawlWorkerConfig,
}

impl CrawlWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        rate: Arc<RateGuard>,
        executor: Arc<dyn JobExecutor>,
        stats: WorkerStats,
        policy: RefreshPolicy,
        config: CrawlWorkerConfig,
    ) -> Self {
        Self {
            store,
            rate,
            executor,
            stats,
            policy,
            config,
        }
    }

    /// Orphan sweep plus due-again requeue for this worker's shard.
    /// Failures are logged; maintenance never takes the loop down.
    async fn maintenance(&self) {
        match self
            .store
            .recover_orphans(&self.config.shard, self.config.orphan_timeout)
            .await
        {
            Ok(0) => {}
            Ok(count) => info!(count, shard = ?self.config.shard, "recovered orphaned jobs"),
            Err(e) => warn!(error = %e, "orphan recovery failed"),
        }
        match self.store.requeue_due(&self.config.shard).await {
            Ok(0) => {}
            Ok(count) => info!(count, "requeued jobs due for refresh"),
            Err(e) => warn!(error = %e, "due-job requeue failed"),
        }
    }

    async fn process_job(&self, job: &CrawlJob, shutdown: &CancellationToken) {
        self.stats.set_current_work(job.reference()).await;
        let started = tokio::time::Instant::now();

        // The claim already bumped attempts; backoff keys off retries.
        let retry = job.attempts.saturating_sub(1).max(0) as u32;

        match self.rate.wait(&job.target_domain, retry).await {
            Ok(()) => {}
            Err(PolitenessError::Quarantined { until, reason, .. }) => {
                info!(
                    job_id = job.id,
                    domain = %job.target_domain,
                    until = %until,
                    reason = %reason,
                    "domain quarantined, deferring job"
                );
                if let Err(e) = self.store.defer(job.id, until).await {
                    warn!(job_id = job.id, error = %e, "failed to defer quarantined job");
                }
                self.stats.clear_current_work().await;
                return;
            }
            Err(PolitenessError::Disallowed { domain, .. }) => {
                let outcome = JobOutcome::Failed {
                    error: format!("robots disallows crawling {}", domain),
                };
                self.finish(job, outcome, started.elapsed()).await;
                return;
            }
            Err(PolitenessError::State(e)) => {
                // Transient store trouble: give the job back and let
                // the normal cycle retry it.
                warn!(job_id = job.id, error = %e, "rate state unavailable, returning job");
                if let Err(e) = self.store.defer(job.id, Utc::now()).await {
                    warn!(job_id = job.id, error = %e, "failed to return job");
                }
                self.stats.clear_current_work().await;
                return;
            }
        }

        let report = self.execute_with_heartbeat(job, shutdown).await;

        match report {
            ExecutionReport::Completed(counts) => {
                let next = Utc::now() + self.policy.interval_for(job.priority_tier);
                let outcome = JobOutcome::Done {
                    counts,
                    next_eligible_at: Some(next),
                };
                self.finish(job, outcome, started.elapsed()).await;
            }
            ExecutionReport::Blocked {
                signal,
                retry_after,
            } => {
                match retry_after {
                    Some(after) => {
                        if let Err(e) = self
                            .rate
                            .handle_rate_limit_signal(&job.target_domain, after)
                            .await
                        {
                            warn!(domain = %job.target_domain, error = %e, "failed to apply retry-after");
                        }
                    }
                    None => {
                        if let Err(e) = self.rate.quarantine(&job.target_domain, &signal).await {
                            warn!(domain = %job.target_domain, error = %e, "failed to quarantine domain");
                        }
                    }
                }
                let outcome = JobOutcome::Failed {
                    error: format!("blocked: {}", signal),
                };
                self.finish(job, outcome, started.elapsed()).await;
            }
            ExecutionReport::Failed { error } => {
                self.finish(job, JobOutcome::Failed { error }, started.elapsed())
                    .await;
            }
        }
    }

    /// Run the executor while a background task keeps the job's
    /// heartbeat fresh, so long fetches are not mistaken for orphans.
    async fn execute_with_heartbeat(
        &self,
        job: &CrawlJob,
        shutdown: &CancellationToken,
    ) -> ExecutionReport {
        let heartbeat_cancel = shutdown.child_token();
        let store = Arc::clone(&self.store);
        let job_id = job.id;
        let interval_duration = self.config.job_heartbeat_interval;

        let ticker = heartbeat_cancel.clone();
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            interval.tick().await; // claim set the first heartbeat
            loop {
                tokio::select! {
                    _ = ticker.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = store.touch_heartbeat(job_id).await {
                            warn!(job_id, error = %e, "job heartbeat failed");
                        }
                    }
                }
            }
        });

        let report = self.executor.execute(job, shutdown).await;

        heartbeat_cancel.cancel();
        let _ = heartbeat.await;
        report
    }

    async fn finish(&self, job: &CrawlJob, outcome: JobOutcome, elapsed: Duration) {
        let completed = match self.store.complete(job.id, &outcome).await {
            Ok(completed) => completed,
            Err(e) => {
                error!(job_id = job.id, error = %e, "failed to record job outcome");
                self.stats.clear_current_work().await;
                return;
            }
        };

        if !completed {
            // Already terminal (double completion or recovered orphan
            // finished elsewhere): counters must not double-count.
            debug!(job_id = job.id, "job already completed, outcome ignored");
        } else {
            match &outcome {
                JobOutcome::Done { counts, .. } => {
                    info!(
                        job_id = job.id,
                        job_ref = %job.reference(),
                        found = counts.found,
                        saved = counts.saved,
                        skipped = counts.skipped,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "job done"
                    );
                    self.stats.record_job_complete(elapsed).await;
                }
                JobOutcome::Failed { error } => {
                    warn!(job_id = job.id, job_ref = %job.reference(), error = %error, "job failed");
                    self.stats.record_job_failed(error).await;
                }
            }
        }
        self.stats.clear_current_work().await;
    }

    async fn sleep_between_jobs(&self, shutdown: &CancellationToken) {
        let (low, high) = self.config.inter_job_delay;
        let span = high.saturating_sub(low).as_millis() as u64;
        let pause = low + Duration::from_millis(if span == 0 { 0 } else { fastrand::u64(0..=span) });
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

#[async_trait]
impl Service for CrawlWorker {
    fn name(&self) -> &'static str {
        "crawl-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker = %self.config.worker_name,
            shard = ?self.config.shard,
            batch_size = self.config.batch_size,
            "crawl worker starting"
        );

        // Startup recovery un-sticks anything a previous incarnation
        // of this shard's workers left behind.
        self.maintenance().await;

        let mut idle = self.config.idle_backoff.clone();
        let mut last_maintenance = tokio::time::Instant::now();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if last_maintenance.elapsed() >= self.config.maintenance_interval {
                self.maintenance().await;
                last_maintenance = tokio::time::Instant::now();
            }

            let jobs = match self
                .store
                .claim_next(
                    &self.config.worker_name,
                    &self.config.shard,
                    self.config.batch_size,
                )
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    // Transient store error: no work this cycle.
                    warn!(error = %e, "claim failed, backing off");
                    let sleep = idle.next_sleep();
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(sleep) => {}
                    }
                    continue;
                }
            };

            if jobs.is_empty() {
                let sleep = idle.next_sleep();
                debug!(sleep_secs = sleep.as_secs(), "no eligible jobs");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(sleep) => {}
                }
                continue;
            }

            idle.reset();
            debug!(count = jobs.len(), "claimed jobs");

            for job in &jobs {
                // Abandoned in-flight jobs stay in_progress and are
                // picked up by orphan recovery on the next startup.
                if shutdown.is_cancelled() {
                    break;
                }
                self.process_job(job, &shutdown).await;
                self.sleep_between_jobs(&shutdown).await;
            }
        }

        info!(worker = %self.config.worker_name, "crawl worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_backoff_grows_and_caps() {
        let mut backoff = IdleBackoff::new(Duration::from_secs(60), 1.5, Duration::from_secs(300));

        assert_eq!(backoff.next_sleep(), Duration::from_secs(60));
        assert_eq!(backoff.next_sleep(), Duration::from_secs(90));
        assert_eq!(backoff.next_sleep(), Duration::from_secs(135));
        for _ in 0..10 {
            backoff.next_sleep();
        }
        assert_eq!(backoff.next_sleep(), Duration::from_secs(300));
    }

    #[test]
    fn idle_backoff_resets_to_base() {
        let mut backoff = IdleBackoff::default();
        backoff.next_sleep();
        backoff.next_sleep();
        backoff.reset();
        assert_eq!(backoff.next_sleep(), Duration::from_secs(60));
    }
}
