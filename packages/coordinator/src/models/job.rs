//! Crawl job model and the atomic claim protocol.
//!
//! All SQL for the `crawl_jobs` table lives here. The claim query is
//! the single mutual-exclusion primitive in the system: `FOR UPDATE
//! SKIP LOCKED` means a concurrent claimer's locked rows are excluded
//! from the result set rather than waited on, so no job is ever handed
//! to two workers and no claimer blocks on another.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;

use crate::executor::ResultCounts;

/// Truncation limit for stored error messages.
const LAST_ERROR_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "crawl_job_status", rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Planned,
    InProgress,
    Done,
    Failed,
}

/// Terminal outcome recorded by `complete`.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Done {
        counts: ResultCounts,
        /// When this target becomes due again, from the refresh policy.
        next_eligible_at: Option<DateTime<Utc>>,
    },
    Failed {
        error: String,
    },
}

impl JobOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, JobOutcome::Done { .. })
    }
}

/// One unit of crawl work: a city+category search target.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct CrawlJob {
    #[builder(default = 0)]
    pub id: i64,

    // Identity / sharding
    pub partition_key: String,
    pub city: String,
    pub category: String,
    pub target_domain: String,

    // Scheduling
    #[builder(default = 3)]
    pub priority_tier: i16,
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default, setter(strip_option))]
    pub next_eligible_at: Option<DateTime<Utc>>,

    // Claim state (non-null iff in_progress)
    #[builder(default, setter(strip_option))]
    pub claimed_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub claimed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub heartbeat_at: Option<DateTime<Utc>>,

    // Attempt tracking
    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 10)]
    pub max_attempts: i32,
    #[builder(default, setter(strip_option))]
    pub last_error: Option<String>,

    // Last recorded result
    #[builder(default = 0)]
    pub found_count: i32,
    #[builder(default = 0)]
    pub saved_count: i32,
    #[builder(default = 0)]
    pub skipped_count: i32,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str = r#"id, partition_key, city, category, target_domain, priority_tier,
    status, next_eligible_at, claimed_by, claimed_at, heartbeat_at,
    attempts, max_attempts, last_error, found_count, saved_count, skipped_count,
    finished_at, created_at, updated_at"#;

impl CrawlJob {
    /// Convenience constructor for a fresh planned target.
    pub fn planned(
        partition_key: &str,
        city: &str,
        category: &str,
        target_domain: &str,
        priority_tier: i16,
    ) -> Self {
        Self::builder()
            .partition_key(partition_key)
            .city(city)
            .category(category)
            .target_domain(target_domain)
            .priority_tier(priority_tier)
            .build()
    }

    /// Reference string used for dashboards and heartbeat rows.
    pub fn reference(&self) -> String {
        format!("{}/{}/{}", self.partition_key, self.city, self.category)
    }

    pub async fn find_by_id(id: i64, pool: &PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(&format!(
            "SELECT {JOB_COLUMNS} FROM crawl_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(pool)
        .await?;
        Ok(job)
    }

    /// Insert a planned job (used by target generation and tests).
    /// Duplicate city+category targets keep the existing row.
    pub async fn insert(&self, pool: &PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO crawl_jobs (
                partition_key, city, category, target_domain, priority_tier,
                status, next_eligible_at, attempts, max_attempts
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (city, category) DO UPDATE
                SET updated_at = NOW()
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(&self.partition_key)
        .bind(&self.city)
        .bind(&self.category)
        .bind(&self.target_domain)
        .bind(self.priority_tier)
        .bind(self.status)
        .bind(self.next_eligible_at)
        .bind(self.attempts)
        .bind(self.max_attempts)
        .fetch_one(pool)
        .await?;
        Ok(job)
    }

    /// Atomically claim up to `limit` eligible jobs for `worker` within
    /// its partition shard.
    ///
    /// Eligibility: planned, due (`next_eligible_at` null or past), and
    /// attempts remaining. Order: `priority_tier ASC, id ASC`. Rows
    /// locked by a concurrent claimer are skipped, never waited on.
    pub async fn claim_next(
        pool: &PgPool,
        worker: &str,
        shard: &[String],
        limit: i64,
    ) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(&format!(
            r#"
            WITH eligible AS (
                SELECT id
                FROM crawl_jobs
                WHERE status = 'planned'
                  AND partition_key = ANY($1)
                  AND (next_eligible_at IS NULL OR next_eligible_at <= NOW())
                  AND attempts < max_attempts
                ORDER BY priority_tier ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE crawl_jobs
            SET status = 'in_progress',
                claimed_by = $3,
                claimed_at = NOW(),
                heartbeat_at = NOW(),
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM eligible)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(shard)
        .bind(limit)
        .bind(worker)
        .fetch_all(pool)
        .await?;

        // RETURNING order is not guaranteed; restore claim order.
        let mut jobs = jobs;
        jobs.sort_by_key(|j| (j.priority_tier, j.id));
        Ok(jobs)
    }

    /// Refresh `heartbeat_at` while work is in progress.
    pub async fn touch_heartbeat(pool: &PgPool, job_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET heartbeat_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(job_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Transition in_progress -> done/failed. Returns `false` if the
    /// job was not in progress (second completion is a no-op, so
    /// aggregate counters never double-count).
    pub async fn complete(pool: &PgPool, job_id: i64, outcome: &JobOutcome) -> Result<bool> {
        let result = match outcome {
            JobOutcome::Done {
                counts,
                next_eligible_at,
            } => {
                sqlx::query(
                    r#"
                    UPDATE crawl_jobs
                    SET status = 'done',
                        found_count = $2,
                        saved_count = $3,
                        skipped_count = $4,
                        last_error = NULL,
                        finished_at = NOW(),
                        next_eligible_at = $5,
                        claimed_by = NULL,
                        claimed_at = NULL,
                        heartbeat_at = NULL,
                        updated_at = NOW()
                    WHERE id = $1 AND status = 'in_progress'
                    "#,
                )
                .bind(job_id)
                .bind(counts.found)
                .bind(counts.saved)
                .bind(counts.skipped)
                .bind(next_eligible_at)
                .execute(pool)
                .await?
            }
            JobOutcome::Failed { error } => {
                sqlx::query(
                    r#"
                    UPDATE crawl_jobs
                    SET status = 'failed',
                        last_error = $2,
                        finished_at = NOW(),
                        claimed_by = NULL,
                        claimed_at = NULL,
                        heartbeat_at = NULL,
                        updated_at = NOW()
                    WHERE id = $1 AND status = 'in_progress'
                    "#,
                )
                .bind(job_id)
                .bind(truncate_error(error))
                .execute(pool)
                .await?
            }
        };

        Ok(result.rows_affected() > 0)
    }

    /// Return an in-progress job to planned with a future due time,
    /// without consuming a real attempt's worth of work (the claim
    /// already counted it). Used when the target domain is quarantined.
    pub async fn defer(pool: &PgPool, job_id: i64, until: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET status = 'planned',
                next_eligible_at = $2,
                claimed_by = NULL,
                claimed_at = NULL,
                heartbeat_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(job_id)
        .bind(until)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Reset in-progress jobs whose heartbeat went silent back to
    /// planned, clearing claim fields. Idempotent; returns how many
    /// orphans were recovered.
    pub async fn recover_orphans(
        pool: &PgPool,
        shard: &[String],
        timeout: std::time::Duration,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET status = 'planned',
                claimed_by = NULL,
                claimed_at = NULL,
                heartbeat_at = NULL,
                updated_at = NOW()
            WHERE status = 'in_progress'
              AND partition_key = ANY($1)
              AND heartbeat_at < NOW() - ($2 || ' seconds')::INTERVAL
            "#,
        )
        .bind(shard)
        .bind(timeout.as_secs().to_string())
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Flip done jobs that are due again back to planned. Attempt
    /// history is preserved (`attempts` only ever moves at claim time).
    pub async fn requeue_due(pool: &PgPool, shard: &[String]) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET status = 'planned', updated_at = NOW()
            WHERE status = 'done'
              AND partition_key = ANY($1)
              AND next_eligible_at IS NOT NULL
              AND next_eligible_at <= NOW()
            "#,
        )
        .bind(shard)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Truncate an error message for storage.
pub fn truncate_error(error: &str) -> String {
    if error.chars().count() <= LAST_ERROR_MAX_CHARS {
        error.to_string()
    } else {
        error.chars().take(LAST_ERROR_MAX_CHARS).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> CrawlJob {
        CrawlJob::planned("MN", "minneapolis", "plumbers", "searchhub.example", 2)
    }

    #[test]
    fn new_job_starts_planned_and_unclaimed() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Planned);
        assert!(job.claimed_by.is_none());
        assert!(job.claimed_at.is_none());
        assert!(job.heartbeat_at.is_none());
    }

    #[test]
    fn new_job_has_attempts_remaining() {
        let job = sample_job();
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 10);
    }

    #[test]
    fn reference_includes_shard_and_target() {
        assert_eq!(sample_job().reference(), "MN/minneapolis/plumbers");
    }

    #[test]
    fn outcome_done_detection() {
        let done = JobOutcome::Done {
            counts: ResultCounts::default(),
            next_eligible_at: None,
        };
        assert!(done.is_done());
        assert!(!JobOutcome::Failed {
            error: "boom".into()
        }
        .is_done());
    }

    #[test]
    fn short_errors_are_stored_verbatim() {
        assert_eq!(truncate_error("timeout"), "timeout");
    }

    #[test]
    fn long_errors_are_truncated() {
        let long = "x".repeat(2_000);
        assert_eq!(truncate_error(&long).chars().count(), 500);
    }
}
