//! Progressive quarantine windows for blocked domains.
//!
//! Each block event for a domain moves it one tier up the schedule;
//! the window expiring does not move it back down. The counter only
//! resets through explicit operator action or long dormancy (no blocks
//! for the configured decay period), never on a successful request, so
//! a flaky domain cannot flap between tiers.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// Schedule of quarantine durations indexed by consecutive block count.
#[derive(Debug, Clone)]
pub struct QuarantineSchedule {
    /// Durations per tier; the last tier repeats for all further blocks.
    tiers: Vec<Duration>,
    /// A domain with no blocks for this long starts back at tier one.
    pub dormancy_decay: Duration,
}

impl Default for QuarantineSchedule {
    fn default() -> Self {
        Self {
            tiers: vec![
                Duration::from_secs(60 * 60),
                Duration::from_secs(2 * 60 * 60),
                Duration::from_secs(4 * 60 * 60),
                Duration::from_secs(8 * 60 * 60),
                Duration::from_secs(24 * 60 * 60),
            ],
            dormancy_decay: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

impl QuarantineSchedule {
    pub fn new(tiers: Vec<Duration>, dormancy_decay: Duration) -> Self {
        debug_assert!(!tiers.is_empty());
        Self {
            tiers,
            dormancy_decay,
        }
    }

    /// Window duration for a domain that has now seen
    /// `consecutive_blocks` block events (1-based).
    pub fn duration_for(&self, consecutive_blocks: u32) -> Duration {
        let index = (consecutive_blocks.max(1) as usize - 1).min(self.tiers.len() - 1);
        self.tiers[index]
    }

    /// Effective block count for the next window, applying dormancy
    /// decay: a long-quiet domain restarts the ladder.
    pub fn effective_blocks(
        &self,
        recorded_blocks: u32,
        last_block_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> u32 {
        match last_block_at {
            Some(at) if now - at >= chrono_from_std(self.dormancy_decay) => 0,
            None => 0,
            _ => recorded_blocks,
        }
    }

    /// End of the quarantine window for a fresh block event.
    pub fn window_end(
        &self,
        recorded_blocks: u32,
        last_block_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> (u32, DateTime<Utc>) {
        let blocks = self.effective_blocks(recorded_blocks, last_block_at, now) + 1;
        let until = now + chrono_from_std(self.duration_for(blocks));
        (blocks, until)
    }
}

fn chrono_from_std(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}
