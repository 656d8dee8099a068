//! Refresh Worker
//!
//! Runs the entity refresh orchestrator: never-processed entities
//! first, then entities due by tier cadence. Module executors are
//! registered here, in execution order.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use coordinator_core::executor::ResultCounts;
use coordinator_core::models::{Entity, WorkerRegistration};
use coordinator_core::refresh::{RefreshOrchestrator, RefreshPolicy, RefreshWorker, RefreshWorkerConfig};
use coordinator_core::registry::{ModuleExecutor, ModuleFailure, ModuleRegistry};
use coordinator_core::reporter::{HeartbeatReporter, WorkerStats};
use coordinator_core::service::ServiceHost;
use coordinator_core::store::PostgresStore;
use coordinator_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "refresh_worker", about = "Entity refresh orchestrator")]
struct Args {
    /// Unique worker name, e.g. refresh-1
    #[arg(long)]
    name: String,

    /// Entities selected per cycle
    #[arg(long, default_value_t = 10)]
    batch_size: i64,
}

/// Placeholder module until the site-specific intelligence modules are
/// linked in: records a run and reports nothing found.
struct NoopIntelModule;

#[async_trait]
impl ModuleExecutor for NoopIntelModule {
    async fn run(&self, entity: &Entity) -> Result<ResultCounts, ModuleFailure> {
        tracing::debug!(entity_id = entity.id, name = %entity.name, "noop module ran");
        Ok(ResultCounts::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,coordinator_core=debug,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    tracing::info!(worker = %args.name, "Starting refresh worker");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let store = PostgresStore::shared(pool);

    let mut registry = ModuleRegistry::new();
    registry.register_critical("website_discovery", Arc::new(NoopIntelModule));
    registry.register("site_crawl", Arc::new(NoopIntelModule));
    registry.register("news_scan", Arc::new(NoopIntelModule));

    let orchestrator = Arc::new(RefreshOrchestrator::new(
        store.clone(),
        Arc::new(registry),
        RefreshPolicy::default(),
    ));

    let stats = WorkerStats::new();
    let worker = RefreshWorker::new(
        orchestrator,
        stats.clone(),
        RefreshWorkerConfig {
            batch_size: args.batch_size,
            ..RefreshWorkerConfig::default()
        },
    );

    let reporter = HeartbeatReporter::new(
        store,
        stats,
        WorkerRegistration::for_process(&args.name, "refresh"),
    )
    .with_interval(config.heartbeat_interval);

    ServiceHost::new()
        .with_service(reporter)
        .with_service(worker)
        .run_until_shutdown()
        .await
}
