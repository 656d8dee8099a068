//! Politeness primitives for a fleet of crawl workers.
//!
//! This crate owns the pure, store-independent half of the politeness
//! layer:
//!
//! - [`RobotsRules`] - robots.txt parsing and crawl-delay lookup
//! - [`DelayPolicy`] - base delay + exponential backoff + jitter
//! - [`QuarantineSchedule`] - progressive per-domain quarantine windows
//! - [`RobotsReader`] - fail-open robots directive source
//!
//! Persistence of per-domain state (last request time, block counters)
//! lives in the coordinator; everything here is deterministic apart
//! from explicit jitter.

pub mod delay;
pub mod error;
pub mod quarantine;
pub mod robots;

pub use delay::DelayPolicy;
pub use error::{PolitenessError, PolitenessResult};
pub use quarantine::QuarantineSchedule;
pub use robots::{HttpRobotsReader, RobotsDirectives, RobotsReader, RobotsRules};
