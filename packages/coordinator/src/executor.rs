//! The executor boundary.
//!
//! The coordinator never inspects fetch payloads; the executor
//! collaborator (site-specific, outside this crate) reports back a
//! classified outcome and counts, and the worker loop records it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::models::CrawlJob;

/// Found/saved/skipped tallies from one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultCounts {
    pub found: i32,
    pub saved: i32,
    pub skipped: i32,
}

impl ResultCounts {
    pub fn new(found: i32, saved: i32, skipped: i32) -> Self {
        Self {
            found,
            saved,
            skipped,
        }
    }
}

/// Classified outcome of one job execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionReport {
    /// The target was processed; counts are final.
    Completed(ResultCounts),
    /// A block signal (CAPTCHA, 403, 429). Not a content failure: the
    /// worker quarantines the domain and tags the job distinctly.
    Blocked {
        signal: String,
        /// Present when the server sent Retry-After.
        retry_after: Option<Duration>,
    },
    /// Any other executor failure, recorded verbatim (truncated).
    Failed { error: String },
}

/// Executes one claimed job. Timeout semantics for a single execution
/// are the executor's responsibility; the coordinator only tracks
/// heartbeats around the call.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &CrawlJob, cancel: &CancellationToken) -> ExecutionReport;
}
