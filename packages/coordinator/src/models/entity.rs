//! Entities tracked by the refresh orchestrator, plus per-module run
//! history.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

use crate::executor::ResultCounts;
use crate::models::job::truncate_error;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub name: String,
    pub priority_tier: i16,
    pub intel_initial_complete: bool,
    pub next_refresh_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub dead_source_count: i32,
    pub last_dead_source_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One recorded subtask execution. Every attempt is kept.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleRun {
    pub entity_id: i64,
    pub module_name: String,
    pub run_type: String,
    pub success: bool,
    pub counts: ResultCounts,
    pub error: Option<String>,
}

impl Entity {
    /// Entities that have never completed initial processing, ordered
    /// by tier then id. These always outrank refresh candidates.
    pub async fn initial_candidates(pool: &PgPool, limit: i64) -> Result<Vec<Self>> {
        let entities = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM entities
            WHERE active AND NOT intel_initial_complete
            ORDER BY priority_tier ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(entities)
    }

    /// Entities due for a periodic refresh.
    pub async fn refresh_candidates(pool: &PgPool, limit: i64) -> Result<Vec<Self>> {
        let entities = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM entities
            WHERE active
              AND intel_initial_complete
              AND (next_refresh_at IS NULL OR next_refresh_at <= NOW())
            ORDER BY priority_tier ASC, next_refresh_at ASC NULLS FIRST, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(entities)
    }

    pub async fn insert(pool: &PgPool, name: &str, priority_tier: i16) -> Result<Self> {
        let entity = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO entities (name, priority_tier)
            VALUES ($1, $2)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(priority_tier)
        .fetch_one(pool)
        .await?;
        Ok(entity)
    }

    /// Mark a full-success cycle: initial processing is complete and
    /// the next refresh is scheduled.
    pub async fn mark_refreshed(
        pool: &PgPool,
        entity_id: i64,
        next_refresh_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE entities
            SET intel_initial_complete = TRUE,
                next_refresh_at = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(entity_id)
        .bind(next_refresh_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Critical-module failure: revoke completion and unset the due
    /// time so the entity is selected as initial work next cycle.
    pub async fn mark_incomplete(pool: &PgPool, entity_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE entities
            SET intel_initial_complete = FALSE,
                next_refresh_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(entity_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Count a dead-source event for the entity. Events older than the
    /// rolling window restart the count; at the threshold the entity is
    /// deactivated and drops out of candidate selection entirely.
    /// Returns true when this call deactivated the entity.
    pub async fn record_dead_source(
        pool: &PgPool,
        entity_id: i64,
        window: std::time::Duration,
        threshold: i32,
    ) -> Result<bool> {
        let deactivated = sqlx::query_scalar::<_, bool>(
            r#"
            UPDATE entities
            SET dead_source_count = CASE
                    WHEN last_dead_source_at IS NULL
                      OR last_dead_source_at < NOW() - ($2 || ' seconds')::INTERVAL
                    THEN 1
                    ELSE dead_source_count + 1
                END,
                last_dead_source_at = NOW(),
                active = CASE
                    WHEN (CASE
                            WHEN last_dead_source_at IS NULL
                              OR last_dead_source_at < NOW() - ($2 || ' seconds')::INTERVAL
                            THEN 1
                            ELSE dead_source_count + 1
                          END) >= $3
                    THEN FALSE
                    ELSE active
                END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING NOT active
            "#,
        )
        .bind(entity_id)
        .bind(window.as_secs().to_string())
        .bind(threshold)
        .fetch_one(pool)
        .await?;
        Ok(deactivated)
    }
}

impl ModuleRun {
    pub async fn insert(&self, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO module_runs
                (entity_id, module_name, run_type, success,
                 found_count, saved_count, skipped_count, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(self.entity_id)
        .bind(&self.module_name)
        .bind(&self.run_type)
        .bind(self.success)
        .bind(self.counts.found)
        .bind(self.counts.saved)
        .bind(self.counts.skipped)
        .bind(self.error.as_deref().map(truncate_error))
        .execute(pool)
        .await?;
        Ok(())
    }
}
