//! Worker liveness reporting.
//!
//! The reporter runs on its own timer, independent of job progress.
//! The worker loop mutates a shared [`WorkerStats`] handle; the
//! reporter only reads and flushes it, so a slow store can never stall
//! job execution.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::models::{HeartbeatSnapshot, WorkerRegistration, WorkerStatus};
use crate::service::Service;
use crate::store::LivenessStore;

#[derive(Debug, Default)]
struct StatsInner {
    snapshot: HeartbeatSnapshot,
    total_job_duration_ms: i64,
}

/// Shared counter handle; every mutation point is safe to call from
/// the worker loop while the reporter reads concurrently.
#[derive(Clone, Default)]
pub struct WorkerStats {
    inner: Arc<tokio::sync::RwLock<StatsInner>>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_current_work(&self, job_ref: impl Into<String>) {
        self.inner.write().await.snapshot.current_job_ref = Some(job_ref.into());
    }

    pub async fn clear_current_work(&self) {
        self.inner.write().await.snapshot.current_job_ref = None;
    }

    pub async fn record_job_complete(&self, duration: Duration) {
        let mut inner = self.inner.write().await;
        inner.snapshot.jobs_completed += 1;
        inner.total_job_duration_ms += duration.as_millis() as i64;
        inner.snapshot.avg_job_duration_ms =
            Some(inner.total_job_duration_ms / inner.snapshot.jobs_completed.max(1));
    }

    pub async fn record_job_failed(&self, error: &str) {
        let mut inner = self.inner.write().await;
        inner.snapshot.jobs_failed += 1;
        inner.snapshot.last_error = Some(error.to_string());
        inner.snapshot.last_error_at = Some(Utc::now());
    }

    pub async fn record_entities(&self, count: i64) {
        self.inner.write().await.snapshot.entities_processed += count;
    }

    pub async fn snapshot(&self) -> HeartbeatSnapshot {
        self.inner.read().await.snapshot.clone()
    }
}

/// Liveness ping sink for an external process supervisor. Absence of a
/// supervisor is a no-op, not an error.
#[async_trait]
pub trait SupervisorSink: Send + Sync {
    async fn notify_alive(&self);
}

/// Default sink when no supervisor is configured.
pub struct NoopSupervisor;

#[async_trait]
impl SupervisorSink for NoopSupervisor {
    async fn notify_alive(&self) {}
}

/// Background service that upserts the worker's heartbeat row on a
/// fixed interval and pings the supervisor.
pub struct HeartbeatReporter {
    store: Arc<dyn LivenessStore>,
    stats: WorkerStats,
    supervisor: Arc<dyn SupervisorSink>,
    registration: WorkerRegistration,
    interval: Duration,
}

impl HeartbeatReporter {
    pub fn new(
        store: Arc<dyn LivenessStore>,
        stats: WorkerStats,
        registration: WorkerRegistration,
    ) -> Self {
        Self {
            store,
            stats,
            supervisor: Arc::new(NoopSupervisor),
            registration,
            interval: Duration::from_secs(30),
        }
    }

    pub fn with_supervisor(mut self, supervisor: Arc<dyn SupervisorSink>) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    async fn tick(&self) {
        let snapshot = self.stats.snapshot().await;
        // A flush failure is logged and skipped; liveness reporting
        // must never take the worker down.
        if let Err(e) = self
            .store
            .flush(&self.registration.worker_name, &snapshot)
            .await
        {
            warn!(worker = %self.registration.worker_name, error = %e, "heartbeat flush failed");
            return;
        }
        self.supervisor.notify_alive().await;
    }
}

#[async_trait]
impl Service for HeartbeatReporter {
    fn name(&self) -> &'static str {
        "heartbeat-reporter"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        self.store
            .upsert_started(&self.registration)
            .await
            .context("failed to register worker heartbeat")?;
        info!(
            worker = %self.registration.worker_name,
            worker_type = %self.registration.worker_type,
            pid = self.registration.pid,
            "heartbeat reporter started"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await; // registration covered the first tick

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }

        // Graceful shutdown writes a terminal status; a crash leaves
        // the row running for the external stale detector.
        if let Err(e) = self
            .store
            .mark_terminal(&self.registration.worker_name, WorkerStatus::Stopped)
            .await
        {
            warn!(worker = %self.registration.worker_name, error = %e, "failed to mark worker stopped");
        }
        info!(worker = %self.registration.worker_name, "heartbeat reporter stopped");
        Ok(())
    }
}
