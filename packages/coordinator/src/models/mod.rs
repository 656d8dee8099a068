//! Persistent models. All SQL lives in these modules.

pub mod domain_rate;
pub mod entity;
pub mod heartbeat;
pub mod job;

pub use domain_rate::{normalize_domain, DomainRateState};
pub use entity::{Entity, ModuleRun};
pub use heartbeat::{HeartbeatSnapshot, WorkerHeartbeat, WorkerRegistration, WorkerStatus};
pub use job::{CrawlJob, JobOutcome, JobStatus};
