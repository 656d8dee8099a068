//! Worker heartbeat rows: one per logical worker process.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "worker_status", rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Running,
    /// Set by external monitoring when heartbeats go silent.
    Stale,
    Stopped,
    Failed,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_name: String,
    pub worker_type: String,
    pub status: WorkerStatus,
    pub pid: i32,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub jobs_completed: i64,
    pub jobs_failed: i64,
    pub entities_processed: i64,
    pub current_job_ref: Option<String>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub avg_job_duration_ms: Option<i64>,
}

/// Identity of the reporting process, fixed at startup.
#[derive(Debug, Clone)]
pub struct WorkerRegistration {
    pub worker_name: String,
    pub worker_type: String,
    pub pid: i32,
    pub hostname: String,
}

impl WorkerRegistration {
    pub fn for_process(worker_name: &str, worker_type: &str) -> Self {
        Self {
            worker_name: worker_name.to_string(),
            worker_type: worker_type.to_string(),
            pid: std::process::id() as i32,
            hostname: hostname(),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

/// Counter snapshot flushed on each reporter tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartbeatSnapshot {
    pub jobs_completed: i64,
    pub jobs_failed: i64,
    pub entities_processed: i64,
    pub current_job_ref: Option<String>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub avg_job_duration_ms: Option<i64>,
}

impl WorkerHeartbeat {
    /// Register the process at startup, resetting counters from any
    /// previous incarnation of the same worker name.
    pub async fn upsert_started(pool: &PgPool, reg: &WorkerRegistration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeats (worker_name, worker_type, status, pid, hostname)
            VALUES ($1, $2, 'running', $3, $4)
            ON CONFLICT (worker_name) DO UPDATE
                SET worker_type = EXCLUDED.worker_type,
                    status = 'running',
                    pid = EXCLUDED.pid,
                    hostname = EXCLUDED.hostname,
                    started_at = NOW(),
                    last_heartbeat_at = NOW(),
                    jobs_completed = 0,
                    jobs_failed = 0,
                    entities_processed = 0,
                    current_job_ref = NULL,
                    last_error = NULL,
                    last_error_at = NULL,
                    avg_job_duration_ms = NULL
            "#,
        )
        .bind(&reg.worker_name)
        .bind(&reg.worker_type)
        .bind(reg.pid)
        .bind(&reg.hostname)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Flush the current counters on a reporter tick.
    pub async fn flush(
        pool: &PgPool,
        worker_name: &str,
        snapshot: &HeartbeatSnapshot,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE worker_heartbeats
            SET last_heartbeat_at = NOW(),
                jobs_completed = $2,
                jobs_failed = $3,
                entities_processed = $4,
                current_job_ref = $5,
                last_error = $6,
                last_error_at = $7,
                avg_job_duration_ms = $8
            WHERE worker_name = $1
            "#,
        )
        .bind(worker_name)
        .bind(snapshot.jobs_completed)
        .bind(snapshot.jobs_failed)
        .bind(snapshot.entities_processed)
        .bind(&snapshot.current_job_ref)
        .bind(&snapshot.last_error)
        .bind(snapshot.last_error_at)
        .bind(snapshot.avg_job_duration_ms)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Record a terminal status on shutdown. A crashed process never
    /// reaches this; its row stays `running` until monitoring flips it.
    pub async fn mark_terminal(
        pool: &PgPool,
        worker_name: &str,
        status: WorkerStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE worker_heartbeats
            SET status = $2, last_heartbeat_at = NOW(), current_job_ref = NULL
            WHERE worker_name = $1
            "#,
        )
        .bind(worker_name)
        .bind(status)
        .execute(pool)
        .await?;
        Ok(())
    }
}
