//! Claim protocol semantics against the in-memory store double. The
//! double serializes claims under one lock, matching what `FOR UPDATE
//! SKIP LOCKED` guarantees across database connections.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use coordinator_core::executor::ResultCounts;
use coordinator_core::models::{CrawlJob, JobOutcome, JobStatus};
use coordinator_core::store::JobStore;
use coordinator_core::testing::MemoryJobStore;

fn shard(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

fn planned(store: &MemoryJobStore, city: &str, category: &str, tier: i16) -> i64 {
    store.insert(CrawlJob::planned("MN", city, category, "searchhub.example", tier))
}

#[tokio::test]
async fn two_claimers_never_share_a_job() {
    let store = Arc::new(MemoryJobStore::new());
    for i in 0..20 {
        planned(&store, &format!("city-{i}"), "plumbers", 3);
    }

    let a = Arc::clone(&store);
    let b = Arc::clone(&store);
    let (claimed_a, claimed_b) = tokio::join!(
        async move { a.claim_next("worker-a", &shard(&["MN"]), 15).await.unwrap() },
        async move { b.claim_next("worker-b", &shard(&["MN"]), 15).await.unwrap() },
    );

    let mut ids: Vec<i64> = claimed_a
        .iter()
        .chain(claimed_b.iter())
        .map(|j| j.id)
        .collect();
    let before = ids.len();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), before, "a job was claimed twice");
    assert_eq!(before, 20);
}

#[tokio::test]
async fn contended_single_job_goes_to_exactly_one_worker() {
    let store = Arc::new(MemoryJobStore::new());
    planned(&store, "minneapolis", "plumbers", 1);

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .claim_next(&format!("worker-{i}"), &shard(&["MN"]), 1)
                .await
                .unwrap()
                .len()
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }
    assert_eq!(total, 1);
}

#[tokio::test]
async fn claims_follow_priority_then_id() {
    let store = MemoryJobStore::new();
    let low = planned(&store, "duluth", "roofers", 3);
    let high_second = planned(&store, "st-paul", "plumbers", 1);
    let high_first = planned(&store, "minneapolis", "plumbers", 1);

    // Lower id wins within a tier, regardless of insert order... but
    // insert order here matches id order, so force the check via ids.
    assert!(high_second < high_first);

    let claimed = store
        .claim_next("worker-a", &shard(&["MN"]), 3)
        .await
        .unwrap();
    let ids: Vec<i64> = claimed.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![high_second, high_first, low]);
}

#[tokio::test]
async fn claim_is_scoped_to_the_shard() {
    let store = MemoryJobStore::new();
    store.insert(CrawlJob::planned(
        "WI",
        "madison",
        "plumbers",
        "searchhub.example",
        1,
    ));
    let mn = planned(&store, "minneapolis", "plumbers", 2);

    let claimed = store
        .claim_next("worker-a", &shard(&["MN"]), 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, mn);
}

#[tokio::test]
async fn future_due_time_excludes_a_job() {
    let store = MemoryJobStore::new();
    let mut job = CrawlJob::planned("MN", "minneapolis", "plumbers", "searchhub.example", 1);
    job.next_eligible_at = Some(Utc::now() + chrono::Duration::hours(1));
    store.insert(job);

    let claimed = store
        .claim_next("worker-a", &shard(&["MN"]), 10)
        .await
        .unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn exhausted_attempts_exclude_a_job() {
    let store = MemoryJobStore::new();
    let mut job = CrawlJob::planned("MN", "minneapolis", "plumbers", "searchhub.example", 1);
    job.attempts = 10;
    job.max_attempts = 10;
    store.insert(job);

    let claimed = store
        .claim_next("worker-a", &shard(&["MN"]), 10)
        .await
        .unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn claim_records_worker_and_bumps_attempts() {
    let store = MemoryJobStore::new();
    let id = planned(&store, "minneapolis", "plumbers", 1);

    let claimed = store
        .claim_next("worker-a", &shard(&["MN"]), 1)
        .await
        .unwrap();
    assert_eq!(claimed[0].attempts, 1);
    assert_eq!(claimed[0].claimed_by.as_deref(), Some("worker-a"));

    let stored = store.get(id).unwrap();
    assert_eq!(stored.status, JobStatus::InProgress);
    assert!(stored.claimed_at.is_some());
    assert!(stored.heartbeat_at.is_some());
}

#[tokio::test]
async fn completion_is_idempotent() {
    let store = MemoryJobStore::new();
    let id = planned(&store, "minneapolis", "plumbers", 1);
    store
        .claim_next("worker-a", &shard(&["MN"]), 1)
        .await
        .unwrap();

    let done = JobOutcome::Done {
        counts: ResultCounts::new(12, 9, 3),
        next_eligible_at: Some(Utc::now() + chrono::Duration::days(1)),
    };
    assert!(store.complete(id, &done).await.unwrap());

    // A second completion (recovered orphan finishing elsewhere) is a
    // no-op and must not flip the terminal state.
    let failed = JobOutcome::Failed {
        error: "late duplicate".into(),
    };
    assert!(!store.complete(id, &failed).await.unwrap());

    let stored = store.get(id).unwrap();
    assert_eq!(stored.status, JobStatus::Done);
    assert_eq!(stored.found_count, 12);
    assert!(stored.last_error.is_none());
    assert!(stored.claimed_by.is_none());
    assert!(stored.heartbeat_at.is_none());
}

#[tokio::test]
async fn failed_outcome_records_the_error() {
    let store = MemoryJobStore::new();
    let id = planned(&store, "minneapolis", "plumbers", 1);
    store
        .claim_next("worker-a", &shard(&["MN"]), 1)
        .await
        .unwrap();

    store
        .complete(
            id,
            &JobOutcome::Failed {
                error: "blocked: http 403".into(),
            },
        )
        .await
        .unwrap();

    let stored = store.get(id).unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.last_error.as_deref(), Some("blocked: http 403"));
}

#[tokio::test]
async fn orphans_are_recovered_after_the_timeout() {
    let store = MemoryJobStore::new();
    let stuck = planned(&store, "minneapolis", "plumbers", 1);
    let healthy = planned(&store, "st-paul", "plumbers", 1);
    store
        .claim_next("worker-a", &shard(&["MN"]), 2)
        .await
        .unwrap();

    store.backdate_heartbeat(stuck, Duration::from_secs(20 * 60));

    let recovered = store
        .recover_orphans(&shard(&["MN"]), Duration::from_secs(15 * 60))
        .await
        .unwrap();
    assert_eq!(recovered, 1);

    let stuck_job = store.get(stuck).unwrap();
    assert_eq!(stuck_job.status, JobStatus::Planned);
    assert!(stuck_job.claimed_by.is_none());
    // Attempt history survives recovery.
    assert_eq!(stuck_job.attempts, 1);

    assert_eq!(store.get(healthy).unwrap().status, JobStatus::InProgress);
}

#[tokio::test]
async fn fresh_heartbeat_prevents_reclaim() {
    let store = MemoryJobStore::new();
    let id = planned(&store, "minneapolis", "plumbers", 1);
    store
        .claim_next("worker-a", &shard(&["MN"]), 1)
        .await
        .unwrap();

    // Heartbeat went stale, then the worker touched it again.
    store.backdate_heartbeat(id, Duration::from_secs(20 * 60));
    store.touch_heartbeat(id).await.unwrap();

    let recovered = store
        .recover_orphans(&shard(&["MN"]), Duration::from_secs(15 * 60))
        .await
        .unwrap();
    assert_eq!(recovered, 0);
    assert_eq!(store.get(id).unwrap().status, JobStatus::InProgress);
}

#[tokio::test]
async fn recovered_job_is_claimable_again() {
    let store = MemoryJobStore::new();
    let id = planned(&store, "minneapolis", "plumbers", 1);
    store
        .claim_next("worker-a", &shard(&["MN"]), 1)
        .await
        .unwrap();
    store.backdate_heartbeat(id, Duration::from_secs(60 * 60));
    store
        .recover_orphans(&shard(&["MN"]), Duration::from_secs(15 * 60))
        .await
        .unwrap();

    let reclaimed = store
        .claim_next("worker-b", &shard(&["MN"]), 1)
        .await
        .unwrap();
    assert_eq!(reclaimed[0].id, id);
    assert_eq!(reclaimed[0].attempts, 2);
    assert_eq!(reclaimed[0].claimed_by.as_deref(), Some("worker-b"));
}

#[tokio::test]
async fn done_jobs_requeue_when_due_again() {
    let store = MemoryJobStore::new();
    let id = planned(&store, "minneapolis", "plumbers", 1);
    store
        .claim_next("worker-a", &shard(&["MN"]), 1)
        .await
        .unwrap();
    store
        .complete(
            id,
            &JobOutcome::Done {
                counts: ResultCounts::default(),
                next_eligible_at: Some(Utc::now() - chrono::Duration::minutes(1)),
            },
        )
        .await
        .unwrap();

    let requeued = store.requeue_due(&shard(&["MN"])).await.unwrap();
    assert_eq!(requeued, 1);
    assert_eq!(store.get(id).unwrap().status, JobStatus::Planned);

    // Not-yet-due done jobs stay put.
    assert_eq!(store.requeue_due(&shard(&["MN"])).await.unwrap(), 0);
}

#[tokio::test]
async fn deferred_job_returns_to_planned_with_due_time() {
    let store = MemoryJobStore::new();
    let id = planned(&store, "minneapolis", "plumbers", 1);
    store
        .claim_next("worker-a", &shard(&["MN"]), 1)
        .await
        .unwrap();

    let until = Utc::now() + chrono::Duration::hours(2);
    store.defer(id, until).await.unwrap();

    let stored = store.get(id).unwrap();
    assert_eq!(stored.status, JobStatus::Planned);
    assert_eq!(stored.next_eligible_at, Some(until));
    assert!(stored.claimed_by.is_none());

    // Not claimable until the quarantine lifts.
    let claimed = store
        .claim_next("worker-b", &shard(&["MN"]), 1)
        .await
        .unwrap();
    assert!(claimed.is_empty());
}
