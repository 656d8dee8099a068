//! Typed errors for the politeness layer.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can
//! match on the quarantine signal instead of string-sniffing.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced by the politeness layer.
#[derive(Debug, Error)]
pub enum PolitenessError {
    /// The domain is under an active quarantine window. Callers must
    /// skip the dispatch entirely rather than retry-loop on it.
    #[error("domain {domain} quarantined until {until} ({reason})")]
    Quarantined {
        domain: String,
        until: DateTime<Utc>,
        reason: String,
    },

    /// robots.txt disallows fetching this path for our agent.
    #[error("robots disallows {path} on {domain}")]
    Disallowed { domain: String, path: String },

    /// Per-domain state could not be read or written.
    #[error("rate state error: {0}")]
    State(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl PolitenessError {
    /// True when the caller should skip the domain instead of treating
    /// this as a job failure.
    pub fn is_quarantined(&self) -> bool {
        matches!(self, PolitenessError::Quarantined { .. })
    }
}

/// Result type alias for politeness operations.
pub type PolitenessResult<T> = std::result::Result<T, PolitenessError>;
