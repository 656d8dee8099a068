//! Heartbeat reporter service over the in-memory liveness store.

use std::sync::Arc;
use std::time::Duration;

use coordinator_core::models::{WorkerRegistration, WorkerStatus};
use coordinator_core::reporter::{HeartbeatReporter, WorkerStats};
use coordinator_core::service::Service;
use coordinator_core::testing::{CountingSupervisor, MemoryLivenessStore};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn reporter_registers_flushes_and_marks_stopped() {
    let store = Arc::new(MemoryLivenessStore::new());
    let supervisor = Arc::new(CountingSupervisor::new());
    let stats = WorkerStats::new();

    stats.record_job_complete(Duration::from_millis(250)).await;
    stats.record_job_failed("fetch timed out").await;

    let reporter = HeartbeatReporter::new(
        Arc::clone(&store) as _,
        stats,
        WorkerRegistration::for_process("crawl-mn-1", "crawl"),
    )
    .with_interval(Duration::from_millis(20))
    .with_supervisor(Arc::clone(&supervisor) as _);

    let token = CancellationToken::new();
    let handle = tokio::spawn(Box::new(reporter).run(token.clone()));

    // Let a few ticks happen on the real clock.
    tokio::time::sleep(Duration::from_millis(120)).await;
    token.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(store.registration_count(), 1);
    assert!(store.flush_count() >= 2, "expected repeated flushes");
    assert_eq!(store.flush_count(), supervisor.pings());

    let last = store.last_flush().unwrap();
    assert_eq!(last.jobs_completed, 1);
    assert_eq!(last.jobs_failed, 1);
    assert_eq!(last.avg_job_duration_ms, Some(250));

    assert_eq!(store.terminal_status(), Some(WorkerStatus::Stopped));
}

#[tokio::test]
async fn counters_mutated_mid_run_show_up_in_later_flushes() {
    let store = Arc::new(MemoryLivenessStore::new());
    let stats = WorkerStats::new();

    let reporter = HeartbeatReporter::new(
        Arc::clone(&store) as _,
        stats.clone(),
        WorkerRegistration::for_process("crawl-mn-2", "crawl"),
    )
    .with_interval(Duration::from_millis(20));

    let token = CancellationToken::new();
    let handle = tokio::spawn(Box::new(reporter).run(token.clone()));

    tokio::time::sleep(Duration::from_millis(30)).await;
    stats.set_current_work("MN/minneapolis/plumbers").await;
    stats.record_entities(4).await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    token.cancel();
    handle.await.unwrap().unwrap();

    let last = store.last_flush().unwrap();
    assert_eq!(last.entities_processed, 4);
    assert_eq!(
        last.current_job_ref.as_deref(),
        Some("MN/minneapolis/plumbers")
    );
}
