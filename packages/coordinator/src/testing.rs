//! In-memory store doubles and scripted executors.
//!
//! These implement the store traits over mutex-guarded maps so the
//! claim protocol, politeness guard, and orchestrator can be tested
//! without a database. Claim mutual exclusion holds by construction:
//! the whole claim runs under one lock, mirroring what `FOR UPDATE
//! SKIP LOCKED` guarantees across connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use politeness::{RobotsDirectives, RobotsReader};
use tokio_util::sync::CancellationToken;

use crate::executor::{ExecutionReport, JobExecutor, ResultCounts};
use crate::models::{
    CrawlJob, DomainRateState, Entity, HeartbeatSnapshot, JobOutcome, JobStatus, ModuleRun,
    WorkerRegistration, WorkerStatus,
};
use crate::models::job::truncate_error;
use crate::registry::{ModuleExecutor, ModuleFailure};
use crate::reporter::SupervisorSink;
use crate::store::{EntityStore, JobStore, LivenessStore, RateStateStore};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<Vec<CrawlJob>>,
    next_id: Mutex<i64>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job, assigning an id if the builder left it at 0.
    pub fn insert(&self, mut job: CrawlJob) -> i64 {
        let mut next_id = self.next_id.lock().unwrap();
        if job.id == 0 {
            *next_id += 1;
            job.id = *next_id;
        } else {
            *next_id = (*next_id).max(job.id);
        }
        let id = job.id;
        self.jobs.lock().unwrap().push(job);
        id
    }

    pub fn get(&self, job_id: i64) -> Option<CrawlJob> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<CrawlJob> {
        self.jobs.lock().unwrap().clone()
    }

    /// Age an in-progress job's heartbeat so orphan recovery sees it.
    pub fn backdate_heartbeat(&self, job_id: i64, age: Duration) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) {
            job.heartbeat_at =
                Some(Utc::now() - chrono::Duration::from_std(age).unwrap_or_default());
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn claim_next(
        &self,
        worker: &str,
        shard: &[String],
        limit: i64,
    ) -> Result<Vec<CrawlJob>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();

        let mut eligible: Vec<usize> = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| {
                j.status == JobStatus::Planned
                    && shard.contains(&j.partition_key)
                    && j.next_eligible_at.map_or(true, |due| due <= now)
                    && j.attempts < j.max_attempts
            })
            .map(|(i, _)| i)
            .collect();
        eligible.sort_by_key(|&i| (jobs[i].priority_tier, jobs[i].id));
        eligible.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(eligible.len());
        for i in eligible {
            let job = &mut jobs[i];
            job.status = JobStatus::InProgress;
            job.claimed_by = Some(worker.to_string());
            job.claimed_at = Some(now);
            job.heartbeat_at = Some(now);
            job.attempts += 1;
            job.updated_at = now;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn touch_heartbeat(&self, job_id: i64) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::InProgress)
        {
            job.heartbeat_at = Some(Utc::now());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn complete(&self, job_id: i64, outcome: &JobOutcome) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::InProgress)
        else {
            return Ok(false);
        };

        let now = Utc::now();
        match outcome {
            JobOutcome::Done {
                counts,
                next_eligible_at,
            } => {
                job.status = JobStatus::Done;
                job.found_count = counts.found;
                job.saved_count = counts.saved;
                job.skipped_count = counts.skipped;
                job.last_error = None;
                job.next_eligible_at = *next_eligible_at;
            }
            JobOutcome::Failed { error } => {
                job.status = JobStatus::Failed;
                job.last_error = Some(truncate_error(error));
            }
        }
        job.finished_at = Some(now);
        job.claimed_by = None;
        job.claimed_at = None;
        job.heartbeat_at = None;
        job.updated_at = now;
        Ok(true)
    }

    async fn defer(&self, job_id: i64, until: DateTime<Utc>) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::InProgress)
        {
            job.status = JobStatus::Planned;
            job.next_eligible_at = Some(until);
            job.claimed_by = None;
            job.claimed_at = None;
            job.heartbeat_at = None;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn recover_orphans(&self, shard: &[String], timeout: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default();
        let mut recovered = 0;
        let mut jobs = self.jobs.lock().unwrap();
        for job in jobs.iter_mut() {
            if job.status == JobStatus::InProgress
                && shard.contains(&job.partition_key)
                && job.heartbeat_at.map_or(false, |hb| hb < cutoff)
            {
                job.status = JobStatus::Planned;
                job.claimed_by = None;
                job.claimed_at = None;
                job.heartbeat_at = None;
                job.updated_at = Utc::now();
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn requeue_due(&self, shard: &[String]) -> Result<u64> {
        let now = Utc::now();
        let mut requeued = 0;
        let mut jobs = self.jobs.lock().unwrap();
        for job in jobs.iter_mut() {
            if job.status == JobStatus::Done
                && shard.contains(&job.partition_key)
                && job.next_eligible_at.map_or(false, |due| due <= now)
            {
                job.status = JobStatus::Planned;
                job.updated_at = now;
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

#[derive(Default)]
pub struct MemoryRateStore {
    states: Mutex<HashMap<String, DomainRateState>>,
}

impl MemoryRateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, state: DomainRateState) {
        self.states
            .lock()
            .unwrap()
            .insert(state.domain.clone(), state);
    }

    pub fn state(&self, domain: &str) -> Option<DomainRateState> {
        self.states.lock().unwrap().get(domain).cloned()
    }

    fn update(&self, domain: &str, apply: impl FnOnce(&mut DomainRateState)) {
        let mut states = self.states.lock().unwrap();
        let state = states
            .entry(domain.to_string())
            .or_insert_with(|| DomainRateState::fresh(domain));
        apply(state);
        state.updated_at = Utc::now();
    }
}

#[async_trait]
impl RateStateStore for MemoryRateStore {
    async fn get(&self, domain: &str) -> Result<Option<DomainRateState>> {
        Ok(self.state(domain))
    }

    async fn touch_request(&self, domain: &str) -> Result<()> {
        self.update(domain, |s| s.last_request_at = Some(Utc::now()));
        Ok(())
    }

    async fn set_crawl_delay(&self, domain: &str, secs: Option<f64>) -> Result<()> {
        self.update(domain, |s| s.crawl_delay_secs = secs);
        Ok(())
    }

    async fn apply_retry_after(&self, domain: &str, until: DateTime<Utc>) -> Result<()> {
        self.update(domain, |s| {
            s.min_next_request_at = Some(s.min_next_request_at.map_or(until, |f| f.max(until)));
        });
        Ok(())
    }

    async fn record_block(
        &self,
        domain: &str,
        consecutive_blocks: i32,
        until: DateTime<Utc>,
        reason: &str,
    ) -> Result<()> {
        self.update(domain, |s| {
            s.consecutive_block_count = consecutive_blocks;
            s.quarantine_until = Some(until);
            s.quarantine_reason = Some(reason.to_string());
            s.last_block_at = Some(Utc::now());
        });
        Ok(())
    }

    async fn reset_blocks(&self, domain: &str) -> Result<()> {
        self.update(domain, |s| {
            s.consecutive_block_count = 0;
            s.quarantine_until = None;
            s.quarantine_reason = None;
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryEntityStore {
    entities: Mutex<Vec<Entity>>,
    runs: Mutex<Vec<ModuleRun>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entity: Entity) {
        self.entities.lock().unwrap().push(entity);
    }

    pub fn entity(&self, id: i64) -> Option<Entity> {
        self.entities
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    pub fn runs(&self) -> Vec<ModuleRun> {
        self.runs.lock().unwrap().clone()
    }

    /// Bare entity for test setup.
    pub fn make_entity(id: i64, name: &str, tier: i16) -> Entity {
        Entity {
            id,
            name: name.to_string(),
            priority_tier: tier,
            intel_initial_complete: false,
            next_refresh_at: None,
            active: true,
            dead_source_count: 0,
            last_dead_source_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn initial_candidates(&self, limit: i64) -> Result<Vec<Entity>> {
        let entities = self.entities.lock().unwrap();
        let mut out: Vec<Entity> = entities
            .iter()
            .filter(|e| e.active && !e.intel_initial_complete)
            .cloned()
            .collect();
        out.sort_by_key(|e| (e.priority_tier, e.id));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn refresh_candidates(&self, limit: i64) -> Result<Vec<Entity>> {
        let now = Utc::now();
        let entities = self.entities.lock().unwrap();
        let mut out: Vec<Entity> = entities
            .iter()
            .filter(|e| {
                e.active
                    && e.intel_initial_complete
                    && e.next_refresh_at.map_or(true, |due| due <= now)
            })
            .cloned()
            .collect();
        // NULL next_refresh_at sorts first, matching the SQL ordering.
        out.sort_by_key(|e| (e.priority_tier, e.next_refresh_at.is_some(), e.next_refresh_at, e.id));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn record_module_run(&self, run: &ModuleRun) -> Result<()> {
        self.runs.lock().unwrap().push(run.clone());
        Ok(())
    }

    async fn mark_refreshed(&self, entity_id: i64, next_refresh_at: DateTime<Utc>) -> Result<()> {
        let mut entities = self.entities.lock().unwrap();
        if let Some(entity) = entities.iter_mut().find(|e| e.id == entity_id) {
            entity.intel_initial_complete = true;
            entity.next_refresh_at = Some(next_refresh_at);
            entity.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_incomplete(&self, entity_id: i64) -> Result<()> {
        let mut entities = self.entities.lock().unwrap();
        if let Some(entity) = entities.iter_mut().find(|e| e.id == entity_id) {
            entity.intel_initial_complete = false;
            entity.next_refresh_at = None;
            entity.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_dead_source(
        &self,
        entity_id: i64,
        window: Duration,
        threshold: i32,
    ) -> Result<bool> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(window).unwrap_or_default();
        let mut entities = self.entities.lock().unwrap();
        let entity = entities
            .iter_mut()
            .find(|e| e.id == entity_id)
            .ok_or_else(|| anyhow!("entity {} not found", entity_id))?;

        entity.dead_source_count = match entity.last_dead_source_at {
            Some(at) if at >= cutoff => entity.dead_source_count + 1,
            _ => 1,
        };
        entity.last_dead_source_at = Some(now);
        if entity.dead_source_count >= threshold {
            entity.active = false;
        }
        entity.updated_at = now;
        Ok(!entity.active)
    }
}

#[derive(Default)]
pub struct MemoryLivenessStore {
    registrations: Mutex<Vec<WorkerRegistration>>,
    flushes: Mutex<Vec<HeartbeatSnapshot>>,
    terminal: Mutex<Option<WorkerStatus>>,
}

impl MemoryLivenessStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.lock().unwrap().len()
    }

    pub fn last_flush(&self) -> Option<HeartbeatSnapshot> {
        self.flushes.lock().unwrap().last().cloned()
    }

    pub fn terminal_status(&self) -> Option<WorkerStatus> {
        *self.terminal.lock().unwrap()
    }
}

#[async_trait]
impl LivenessStore for MemoryLivenessStore {
    async fn upsert_started(&self, reg: &WorkerRegistration) -> Result<()> {
        self.registrations.lock().unwrap().push(reg.clone());
        Ok(())
    }

    async fn flush(&self, _worker_name: &str, snapshot: &HeartbeatSnapshot) -> Result<()> {
        self.flushes.lock().unwrap().push(snapshot.clone());
        Ok(())
    }

    async fn mark_terminal(&self, _worker_name: &str, status: WorkerStatus) -> Result<()> {
        *self.terminal.lock().unwrap() = Some(status);
        Ok(())
    }
}

/// Robots reader with fixed per-domain directives; unknown domains get
/// the permissive default.
#[derive(Default)]
pub struct StaticRobots {
    directives: Mutex<HashMap<String, RobotsDirectives>>,
}

impl StaticRobots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_all() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set(&self, domain: &str, directives: RobotsDirectives) {
        self.directives
            .lock()
            .unwrap()
            .insert(domain.to_string(), directives);
    }
}

#[async_trait]
impl RobotsReader for StaticRobots {
    async fn directives(&self, domain: &str, _path: &str) -> RobotsDirectives {
        self.directives
            .lock()
            .unwrap()
            .get(domain)
            .cloned()
            .unwrap_or_else(RobotsDirectives::permissive)
    }
}

/// Job executor returning a scripted report per job id, with a default
/// for anything unscripted.
pub struct StubExecutor {
    scripted: Mutex<HashMap<i64, ExecutionReport>>,
    default: ExecutionReport,
}

impl Default for StubExecutor {
    fn default() -> Self {
        Self {
            scripted: Mutex::new(HashMap::new()),
            default: ExecutionReport::Completed(ResultCounts::default()),
        }
    }
}

impl StubExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completing_with(counts: ResultCounts) -> Self {
        Self {
            scripted: Mutex::new(HashMap::new()),
            default: ExecutionReport::Completed(counts),
        }
    }

    pub fn script(&self, job_id: i64, report: ExecutionReport) {
        self.scripted.lock().unwrap().insert(job_id, report);
    }
}

#[async_trait]
impl JobExecutor for StubExecutor {
    async fn execute(&self, job: &CrawlJob, _cancel: &CancellationToken) -> ExecutionReport {
        self.scripted
            .lock()
            .unwrap()
            .get(&job.id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Module executor that pops scripted outcomes in order, then keeps
/// returning the last one.
pub struct ScriptedModule {
    outcomes: Mutex<Vec<Result<ResultCounts, (String, Option<String>)>>>,
}

impl ScriptedModule {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(vec![Ok(ResultCounts::default())]),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(vec![Err((message.to_string(), None))]),
        })
    }

    pub fn failing_fetch(message: &str, host: &str) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(vec![Err((message.to_string(), Some(host.to_string())))]),
        })
    }

    pub fn sequence(outcomes: Vec<Result<ResultCounts, (String, Option<String>)>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes),
        })
    }
}

#[async_trait]
impl ModuleExecutor for ScriptedModule {
    async fn run(&self, _entity: &Entity) -> Result<ResultCounts, ModuleFailure> {
        let mut outcomes = self.outcomes.lock().unwrap();
        let outcome = if outcomes.len() > 1 {
            outcomes.remove(0)
        } else {
            outcomes
                .first()
                .cloned()
                .unwrap_or(Ok(ResultCounts::default()))
        };
        outcome.map_err(|(message, host)| match host {
            Some(host) => ModuleFailure::fetch(message, host),
            None => ModuleFailure::new(message),
        })
    }
}

/// Supervisor sink that counts liveness pings.
#[derive(Default)]
pub struct CountingSupervisor {
    pings: std::sync::atomic::AtomicUsize,
}

impl CountingSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pings(&self) -> usize {
        self.pings.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl SupervisorSink for CountingSupervisor {
    async fn notify_alive(&self) {
        self.pings
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}
