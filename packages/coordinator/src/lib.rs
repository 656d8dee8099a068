//! Job coordination for a distributed scraping fleet.
//!
//! Workers are independent OS processes sharing nothing but the
//! database. The crate provides the atomic claim protocol over
//! `crawl_jobs`, per-domain politeness enforcement backed by shared
//! rate state, worker liveness reporting, and the entity refresh
//! orchestrator. What happens inside a fetch is the executor's
//! business; this crate decides who works on what, and when.

pub mod config;
pub mod executor;
pub mod models;
pub mod rate_guard;
pub mod refresh;
pub mod registry;
pub mod reporter;
pub mod service;
pub mod store;
pub mod testing;
pub mod worker;

pub use config::Config;
pub use executor::{ExecutionReport, JobExecutor, ResultCounts};
pub use models::{CrawlJob, JobOutcome, JobStatus};
pub use rate_guard::RateGuard;
pub use refresh::{RefreshOrchestrator, RefreshPolicy, RefreshWorker, RunType};
pub use registry::{ModuleExecutor, ModuleFailure, ModuleRegistry};
pub use reporter::{HeartbeatReporter, WorkerStats};
pub use service::{Service, ServiceHost};
pub use store::{EntityStore, JobStore, LivenessStore, PostgresStore, RateStateStore};
pub use worker::{CrawlWorker, CrawlWorkerConfig, IdleBackoff};
