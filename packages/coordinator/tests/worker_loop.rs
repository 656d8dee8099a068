//! Crawl worker loop end to end over the in-memory doubles: claim,
//! politeness, execution, outcome recording, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use coordinator_core::executor::{ExecutionReport, ResultCounts};
use coordinator_core::models::{CrawlJob, JobStatus};
use coordinator_core::rate_guard::RateGuard;
use coordinator_core::refresh::RefreshPolicy;
use coordinator_core::reporter::WorkerStats;
use coordinator_core::service::Service;
use coordinator_core::testing::{MemoryJobStore, MemoryRateStore, StaticRobots, StubExecutor};
use coordinator_core::worker::{CrawlWorker, CrawlWorkerConfig, IdleBackoff};
use politeness::{DelayPolicy, QuarantineSchedule};
use tokio_util::sync::CancellationToken;

struct Fixture {
    jobs: Arc<MemoryJobStore>,
    rates: Arc<MemoryRateStore>,
    executor: Arc<StubExecutor>,
    stats: WorkerStats,
}

impl Fixture {
    fn new() -> Self {
        Self {
            jobs: Arc::new(MemoryJobStore::new()),
            rates: Arc::new(MemoryRateStore::new()),
            executor: Arc::new(StubExecutor::new()),
            stats: WorkerStats::new(),
        }
    }

    fn worker(&self) -> CrawlWorker {
        // Zeroed delays so tests drive the loop, not the clock.
        let policy = DelayPolicy {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            max_backoff: Duration::ZERO,
        };
        let rate = Arc::new(RateGuard::new(
            Arc::clone(&self.rates) as _,
            StaticRobots::allow_all(),
            policy,
            QuarantineSchedule::default(),
        ));
        let mut config = CrawlWorkerConfig::new("worker-test", vec!["MN".to_string()]);
        config.inter_job_delay = (Duration::ZERO, Duration::ZERO);
        config.idle_backoff = IdleBackoff::new(Duration::from_millis(10), 1.5, Duration::from_millis(50));
        CrawlWorker::new(
            Arc::clone(&self.jobs) as _,
            rate,
            Arc::clone(&self.executor) as _,
            self.stats.clone(),
            RefreshPolicy::default(),
            config,
        )
    }

    /// Run the worker until `check` passes or the deadline hits.
    async fn run_until(&self, check: impl Fn(&MemoryJobStore) -> bool) {
        let token = CancellationToken::new();
        let handle = tokio::spawn(Box::new(self.worker()).run(token.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check(&self.jobs) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        token.cancel();
        handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn successful_job_is_done_with_counts_and_next_due_time() {
    let fixture = Fixture::new();
    let id = fixture.jobs.insert(CrawlJob::planned(
        "MN",
        "minneapolis",
        "plumbers",
        "searchhub.example",
        1,
    ));
    fixture
        .executor
        .script(id, ExecutionReport::Completed(ResultCounts::new(20, 15, 5)));

    fixture
        .run_until(|jobs| jobs.get(id).map_or(false, |j| j.status == JobStatus::Done))
        .await;

    let job = fixture.jobs.get(id).unwrap();
    assert_eq!(job.found_count, 20);
    assert_eq!(job.saved_count, 15);
    assert_eq!(job.skipped_count, 5);
    // Tier 1 refreshes daily.
    let due = job.next_eligible_at.unwrap();
    assert!(due > Utc::now() + chrono::Duration::hours(23));
    assert!(due < Utc::now() + chrono::Duration::hours(25));

    assert_eq!(fixture.stats.snapshot().await.jobs_completed, 1);
}

#[tokio::test]
async fn block_signal_quarantines_the_domain_and_fails_the_job() {
    let fixture = Fixture::new();
    let id = fixture.jobs.insert(CrawlJob::planned(
        "MN",
        "minneapolis",
        "plumbers",
        "hostile.example",
        1,
    ));
    fixture.executor.script(
        id,
        ExecutionReport::Blocked {
            signal: "captcha interstitial".into(),
            retry_after: None,
        },
    );

    fixture
        .run_until(|jobs| jobs.get(id).map_or(false, |j| j.status == JobStatus::Failed))
        .await;

    let job = fixture.jobs.get(id).unwrap();
    assert_eq!(
        job.last_error.as_deref(),
        Some("blocked: captcha interstitial")
    );

    let state = fixture.rates.state("hostile.example").unwrap();
    assert!(state.quarantine_until.unwrap() > Utc::now());
    assert_eq!(state.consecutive_block_count, 1);
}

#[tokio::test]
async fn retry_after_applies_a_floor_instead_of_quarantining() {
    let fixture = Fixture::new();
    let id = fixture.jobs.insert(CrawlJob::planned(
        "MN",
        "minneapolis",
        "plumbers",
        "ratelimited.example",
        1,
    ));
    fixture.executor.script(
        id,
        ExecutionReport::Blocked {
            signal: "http 429".into(),
            retry_after: Some(Duration::from_secs(600)),
        },
    );

    fixture
        .run_until(|jobs| jobs.get(id).map_or(false, |j| j.status == JobStatus::Failed))
        .await;

    let state = fixture.rates.state("ratelimited.example").unwrap();
    assert!(state.quarantine_until.is_none());
    assert!(state.min_next_request_at.unwrap() > Utc::now() + chrono::Duration::minutes(9));
}

#[tokio::test]
async fn quarantined_domain_defers_the_job_untouched() {
    let fixture = Fixture::new();
    let id = fixture.jobs.insert(CrawlJob::planned(
        "MN",
        "minneapolis",
        "plumbers",
        "blocked.example",
        1,
    ));
    let mut state = coordinator_core::models::DomainRateState::fresh("blocked.example");
    state.quarantine_until = Some(Utc::now() + chrono::Duration::hours(4));
    state.quarantine_reason = Some("http 403".into());
    fixture.rates.set(state);

    fixture
        .run_until(|jobs| {
            jobs.get(id).map_or(false, |j| {
                j.status == JobStatus::Planned && j.next_eligible_at.is_some()
            })
        })
        .await;

    let job = fixture.jobs.get(id).unwrap();
    // Deferred to the quarantine end, not failed and no executor run.
    assert!(job.next_eligible_at.unwrap() > Utc::now() + chrono::Duration::hours(3));
    assert!(job.last_error.is_none());
    assert_eq!(fixture.stats.snapshot().await.jobs_failed, 0);
}

#[tokio::test]
async fn worker_drains_a_batch_in_priority_order() {
    let fixture = Fixture::new();
    for (city, tier) in [("duluth", 3), ("minneapolis", 1), ("st-paul", 2)] {
        fixture.jobs.insert(CrawlJob::planned(
            "MN",
            city,
            "plumbers",
            "searchhub.example",
            tier,
        ));
    }

    fixture
        .run_until(|jobs| jobs.all().iter().all(|j| j.status == JobStatus::Done))
        .await;

    let done: Vec<_> = fixture.jobs.all();
    let mut finished: Vec<_> = done
        .iter()
        .map(|j| (j.finished_at.unwrap(), j.priority_tier))
        .collect();
    finished.sort();
    let tiers: Vec<i16> = finished.iter().map(|(_, t)| *t).collect();
    assert_eq!(tiers, vec![1, 2, 3]);
}

#[tokio::test]
async fn shutdown_leaves_unclaimed_jobs_planned() {
    let fixture = Fixture::new();
    let id = fixture.jobs.insert(CrawlJob::planned(
        "MN",
        "minneapolis",
        "plumbers",
        "searchhub.example",
        1,
    ));

    let token = CancellationToken::new();
    token.cancel();
    Box::new(fixture.worker()).run(token).await.unwrap();

    assert_eq!(fixture.jobs.get(id).unwrap().status, JobStatus::Planned);
}
