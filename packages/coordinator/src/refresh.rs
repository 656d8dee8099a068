//! Refresh orchestration: tier-based cadence and candidate selection.
//!
//! The orchestrator runs every registered module against each selected
//! entity, every cycle. Per-module freshness windows are deliberately
//! not tracked; the cadence lives on the entity.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{Entity, ModuleRun};
use crate::registry::ModuleRegistry;
use crate::reporter::WorkerStats;
use crate::service::Service;
use crate::store::EntityStore;
use crate::worker::IdleBackoff;

/// How often an entity's work is due again, keyed by priority tier.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    intervals: BTreeMap<i16, Duration>,
    default_interval: Duration,
    pub dead_source_window: Duration,
    pub dead_source_threshold: i32,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        let mut intervals = BTreeMap::new();
        intervals.insert(1, Duration::from_secs(24 * 60 * 60));
        intervals.insert(2, Duration::from_secs(2 * 24 * 60 * 60));
        Self {
            intervals,
            default_interval: Duration::from_secs(7 * 24 * 60 * 60),
            dead_source_window: Duration::from_secs(7 * 24 * 60 * 60),
            dead_source_threshold: 5,
        }
    }
}

impl RefreshPolicy {
    pub fn interval_for(&self, tier: i16) -> chrono::Duration {
        let interval = self
            .intervals
            .get(&tier)
            .copied()
            .unwrap_or(self.default_interval);
        chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::days(7))
    }

    pub fn with_interval(mut self, tier: i16, interval: Duration) -> Self {
        self.intervals.insert(tier, interval);
        self
    }

    pub fn with_dead_source(mut self, window: Duration, threshold: i32) -> Self {
        self.dead_source_window = window;
        self.dead_source_threshold = threshold;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunType {
    Initial,
    Refresh,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Initial => "initial",
            RunType::Refresh => "refresh",
        }
    }
}

/// Outcome of one entity cycle.
#[derive(Debug, Clone)]
pub struct EntityCycle {
    pub entity_id: i64,
    pub run_type: RunType,
    pub modules_run: usize,
    pub failed_modules: Vec<String>,
    /// True when every critical module succeeded and the entity was
    /// marked complete with a scheduled next refresh.
    pub completed: bool,
    pub deactivated: bool,
}

pub struct RefreshOrchestrator {
    entities: Arc<dyn EntityStore>,
    registry: Arc<ModuleRegistry>,
    policy: RefreshPolicy,
}

impl RefreshOrchestrator {
    pub fn new(
        entities: Arc<dyn EntityStore>,
        registry: Arc<ModuleRegistry>,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            entities,
            registry,
            policy,
        }
    }

    /// Select the next batch: never-processed entities first (by tier,
    /// then id), then entities due for refresh.
    pub async fn candidates(&self, limit: i64) -> Result<Vec<(Entity, RunType)>> {
        let mut out = Vec::new();
        for entity in self.entities.initial_candidates(limit).await? {
            out.push((entity, RunType::Initial));
        }
        let remaining = limit - out.len() as i64;
        if remaining > 0 {
            for entity in self.entities.refresh_candidates(remaining).await? {
                out.push((entity, RunType::Refresh));
            }
        }
        Ok(out)
    }

    /// Run every registered module against the entity, in registration
    /// order. A module failure is recorded and the cycle continues;
    /// only critical-module failures withhold completion, which sends
    /// the entity back through initial selection next cycle.
    pub async fn process_entity(&self, entity: &Entity, run_type: RunType) -> Result<EntityCycle> {
        let mut cycle = EntityCycle {
            entity_id: entity.id,
            run_type,
            modules_run: 0,
            failed_modules: Vec::new(),
            completed: false,
            deactivated: false,
        };
        let mut critical_failed = false;

        for (name, module) in self.registry.iter() {
            cycle.modules_run += 1;
            let outcome = module.run(entity).await;

            let run = match &outcome {
                Ok(counts) => ModuleRun {
                    entity_id: entity.id,
                    module_name: name.to_string(),
                    run_type: run_type.as_str().to_string(),
                    success: true,
                    counts: *counts,
                    error: None,
                },
                Err(failure) => ModuleRun {
                    entity_id: entity.id,
                    module_name: name.to_string(),
                    run_type: run_type.as_str().to_string(),
                    success: false,
                    counts: Default::default(),
                    error: Some(failure.to_string()),
                },
            };
            self.entities.record_module_run(&run).await?;

            if let Err(failure) = outcome {
                warn!(
                    entity_id = entity.id,
                    module = name,
                    error = %failure,
                    "module failed"
                );
                cycle.failed_modules.push(name.to_string());
                if self.registry.is_critical(name) {
                    critical_failed = true;
                }
                if let Some(host) = &failure.failed_host {
                    let deactivated = self
                        .entities
                        .record_dead_source(
                            entity.id,
                            self.policy.dead_source_window,
                            self.policy.dead_source_threshold,
                        )
                        .await?;
                    if deactivated {
                        info!(entity_id = entity.id, host = %host, "entity deactivated after repeated dead sources");
                        cycle.deactivated = true;
                        return Ok(cycle);
                    }
                }
            }
        }

        if !critical_failed {
            let next = Utc::now() + self.policy.interval_for(entity.priority_tier);
            self.entities.mark_refreshed(entity.id, next).await?;
            cycle.completed = true;
            debug!(entity_id = entity.id, next_refresh = %next, "entity cycle complete");
        } else {
            // Revoke completion even on a refresh run: the entity goes
            // back through initial selection with no due time.
            self.entities.mark_incomplete(entity.id).await?;
            info!(
                entity_id = entity.id,
                failed = ?cycle.failed_modules,
                "critical module failed, entity reverts to initial work"
            );
        }

        Ok(cycle)
    }
}

#[derive(Debug, Clone)]
pub struct RefreshWorkerConfig {
    pub batch_size: i64,
    pub inter_entity_delay: Duration,
    pub idle_backoff: IdleBackoff,
}

impl Default for RefreshWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            inter_entity_delay: Duration::from_secs(5),
            idle_backoff: IdleBackoff::default(),
        }
    }
}

/// Long-running service that drains refresh candidates.
pub struct RefreshWorker {
    orchestrator: Arc<RefreshOrchestrator>,
    stats: WorkerStats,
    config: RefreshWorkerConfig,
}

impl RefreshWorker {
    pub fn new(
        orchestrator: Arc<RefreshOrchestrator>,
        stats: WorkerStats,
        config: RefreshWorkerConfig,
    ) -> Self {
        Self {
            orchestrator,
            stats,
            config,
        }
    }
}

#[async_trait]
impl Service for RefreshWorker {
    fn name(&self) -> &'static str {
        "refresh-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(batch_size = self.config.batch_size, "refresh worker starting");
        let mut idle = self.config.idle_backoff.clone();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let batch = match self.orchestrator.candidates(self.config.batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "candidate selection failed, backing off");
                    let sleep = idle.next_sleep();
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(sleep) => {}
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                let sleep = idle.next_sleep();
                debug!(sleep_secs = sleep.as_secs(), "no entities due");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(sleep) => {}
                }
                continue;
            }

            idle.reset();
            for (entity, run_type) in &batch {
                if shutdown.is_cancelled() {
                    break;
                }
                self.stats
                    .set_current_work(format!("entity:{}:{}", entity.id, run_type.as_str()))
                    .await;
                match self.orchestrator.process_entity(entity, *run_type).await {
                    Ok(cycle) => {
                        self.stats.record_entities(1).await;
                        if !cycle.failed_modules.is_empty() && !cycle.completed {
                            self.stats
                                .record_job_failed(&format!(
                                    "entity {} incomplete: {}",
                                    entity.id,
                                    cycle.failed_modules.join(", ")
                                ))
                                .await;
                        }
                    }
                    Err(e) => {
                        warn!(entity_id = entity.id, error = %e, "entity cycle errored");
                        self.stats.record_job_failed(&e.to_string()).await;
                    }
                }
                self.stats.clear_current_work().await;

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.inter_entity_delay) => {}
                }
            }
        }

        info!("refresh worker stopped");
        Ok(())
    }
}
