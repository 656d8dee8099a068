//! Store traits and their PostgreSQL implementations.
//!
//! The traits exist so the worker loop and orchestrator can be
//! exercised against in-memory doubles (see [`crate::testing`]); the
//! Postgres implementations delegate to the model modules, which own
//! the SQL.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{
    CrawlJob, DomainRateState, Entity, HeartbeatSnapshot, JobOutcome, ModuleRun, WorkerHeartbeat,
    WorkerRegistration, WorkerStatus,
};

/// Claim protocol and job lifecycle operations.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically claim up to `limit` eligible jobs in the shard.
    /// Returns an empty vec (not an error) when nothing is eligible.
    async fn claim_next(&self, worker: &str, shard: &[String], limit: i64)
        -> Result<Vec<CrawlJob>>;

    /// Refresh the heartbeat of an in-progress job.
    async fn touch_heartbeat(&self, job_id: i64) -> Result<()>;

    /// Record a terminal outcome. Returns false when the job was not
    /// in progress (idempotent completion).
    async fn complete(&self, job_id: i64, outcome: &JobOutcome) -> Result<bool>;

    /// Return an in-progress job to planned with a future due time.
    async fn defer(&self, job_id: i64, until: DateTime<Utc>) -> Result<()>;

    /// Reset in-progress jobs with silent heartbeats back to planned.
    async fn recover_orphans(&self, shard: &[String], timeout: Duration) -> Result<u64>;

    /// Flip done jobs that are due again back to planned.
    async fn requeue_due(&self, shard: &[String]) -> Result<u64>;
}

/// Shared per-domain politeness state.
#[async_trait]
pub trait RateStateStore: Send + Sync {
    async fn get(&self, domain: &str) -> Result<Option<DomainRateState>>;
    async fn touch_request(&self, domain: &str) -> Result<()>;
    async fn set_crawl_delay(&self, domain: &str, secs: Option<f64>) -> Result<()>;
    async fn apply_retry_after(&self, domain: &str, until: DateTime<Utc>) -> Result<()>;
    async fn record_block(
        &self,
        domain: &str,
        consecutive_blocks: i32,
        until: DateTime<Utc>,
        reason: &str,
    ) -> Result<()>;
    async fn reset_blocks(&self, domain: &str) -> Result<()>;
}

/// Refresh orchestrator persistence.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn initial_candidates(&self, limit: i64) -> Result<Vec<Entity>>;
    async fn refresh_candidates(&self, limit: i64) -> Result<Vec<Entity>>;
    async fn record_module_run(&self, run: &ModuleRun) -> Result<()>;
    async fn mark_refreshed(&self, entity_id: i64, next_refresh_at: DateTime<Utc>) -> Result<()>;
    /// Revoke completion after a critical-module failure so the entity
    /// is retried as initial work.
    async fn mark_incomplete(&self, entity_id: i64) -> Result<()>;
    /// Returns true when the event deactivated the entity.
    async fn record_dead_source(
        &self,
        entity_id: i64,
        window: Duration,
        threshold: i32,
    ) -> Result<bool>;
}

/// Worker heartbeat persistence, used by the reporter.
#[async_trait]
pub trait LivenessStore: Send + Sync {
    async fn upsert_started(&self, reg: &WorkerRegistration) -> Result<()>;
    async fn flush(&self, worker_name: &str, snapshot: &HeartbeatSnapshot) -> Result<()>;
    async fn mark_terminal(&self, worker_name: &str, status: WorkerStatus) -> Result<()>;
}

/// PostgreSQL-backed stores sharing one pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Convenience: one instance serves all four store traits.
    pub fn shared(pool: PgPool) -> Arc<Self> {
        Arc::new(Self::new(pool))
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn claim_next(
        &self,
        worker: &str,
        shard: &[String],
        limit: i64,
    ) -> Result<Vec<CrawlJob>> {
        CrawlJob::claim_next(&self.pool, worker, shard, limit).await
    }

    async fn touch_heartbeat(&self, job_id: i64) -> Result<()> {
        CrawlJob::touch_heartbeat(&self.pool, job_id).await
    }

    async fn complete(&self, job_id: i64, outcome: &JobOutcome) -> Result<bool> {
        CrawlJob::complete(&self.pool, job_id, outcome).await
    }

    async fn defer(&self, job_id: i64, until: DateTime<Utc>) -> Result<()> {
        CrawlJob::defer(&self.pool, job_id, until).await
    }

    async fn recover_orphans(&self, shard: &[String], timeout: Duration) -> Result<u64> {
        CrawlJob::recover_orphans(&self.pool, shard, timeout).await
    }

    async fn requeue_due(&self, shard: &[String]) -> Result<u64> {
        CrawlJob::requeue_due(&self.pool, shard).await
    }
}

#[async_trait]
impl RateStateStore for PostgresStore {
    async fn get(&self, domain: &str) -> Result<Option<DomainRateState>> {
        DomainRateState::fetch(&self.pool, domain).await
    }

    async fn touch_request(&self, domain: &str) -> Result<()> {
        DomainRateState::touch_request(&self.pool, domain).await
    }

    async fn set_crawl_delay(&self, domain: &str, secs: Option<f64>) -> Result<()> {
        DomainRateState::set_crawl_delay(&self.pool, domain, secs).await
    }

    async fn apply_retry_after(&self, domain: &str, until: DateTime<Utc>) -> Result<()> {
        DomainRateState::apply_retry_after(&self.pool, domain, until).await
    }

    async fn record_block(
        &self,
        domain: &str,
        consecutive_blocks: i32,
        until: DateTime<Utc>,
        reason: &str,
    ) -> Result<()> {
        DomainRateState::record_block(&self.pool, domain, consecutive_blocks, until, reason).await
    }

    async fn reset_blocks(&self, domain: &str) -> Result<()> {
        DomainRateState::reset_blocks(&self.pool, domain).await
    }
}

#[async_trait]
impl EntityStore for PostgresStore {
    async fn initial_candidates(&self, limit: i64) -> Result<Vec<Entity>> {
        Entity::initial_candidates(&self.pool, limit).await
    }

    async fn refresh_candidates(&self, limit: i64) -> Result<Vec<Entity>> {
        Entity::refresh_candidates(&self.pool, limit).await
    }

    async fn record_module_run(&self, run: &ModuleRun) -> Result<()> {
        run.insert(&self.pool).await
    }

    async fn mark_refreshed(&self, entity_id: i64, next_refresh_at: DateTime<Utc>) -> Result<()> {
        Entity::mark_refreshed(&self.pool, entity_id, next_refresh_at).await
    }

    async fn mark_incomplete(&self, entity_id: i64) -> Result<()> {
        Entity::mark_incomplete(&self.pool, entity_id).await
    }

    async fn record_dead_source(
        &self,
        entity_id: i64,
        window: Duration,
        threshold: i32,
    ) -> Result<bool> {
        Entity::record_dead_source(&self.pool, entity_id, window, threshold).await
    }
}

#[async_trait]
impl LivenessStore for PostgresStore {
    async fn upsert_started(&self, reg: &WorkerRegistration) -> Result<()> {
        WorkerHeartbeat::upsert_started(&self.pool, reg).await
    }

    async fn flush(&self, worker_name: &str, snapshot: &HeartbeatSnapshot) -> Result<()> {
        WorkerHeartbeat::flush(&self.pool, worker_name, snapshot).await
    }

    async fn mark_terminal(&self, worker_name: &str, status: WorkerStatus) -> Result<()> {
        WorkerHeartbeat::mark_terminal(&self.pool, worker_name, status).await
    }
}
