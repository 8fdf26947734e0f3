//! SQLite-backed [`BuildCache`] implementation.
//!
//! Every state transition is a single SQL statement, so the conditional
//! `ON CONFLICT ... DO UPDATE ... WHERE status IN (...)` upserts are atomic
//! with respect to other connections in the pool. `rows_affected()` tells
//! the caller whether it won the transition.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use context_bundler_core::cache::BuildCache;
use context_bundler_core::models::{
    BuildStatus, BundleMeta, CacheEntry, CacheKey, ContextBundle, Failure, FailureCause,
};

/// SQLite implementation of the [`BuildCache`] trait over the
/// `context_cache` table.
pub struct SqliteBuildCache {
    pool: SqlitePool,
}

impl SqliteBuildCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Upserts the entry into `status`, unless it currently has one of the
    /// `blocked` statuses. Returns whether a row was written.
    async fn transition(&self, key: &CacheKey, status: BuildStatus, blocked: &str) -> Result<bool> {
        let sql = format!(
            r#"
            INSERT INTO context_cache (project, document_type, status, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(project, document_type) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at
            WHERE context_cache.status NOT IN ({})
            "#,
            blocked
        );
        let result = sqlx::query(&sql)
            .bind(&key.project)
            .bind(&key.document_type)
            .bind(status.as_str())
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Upserts a `READY` row; `guard` is an optional `WHERE` on the
    /// conflicting row. Returns whether a row was written.
    async fn store_ready(
        &self,
        key: &CacheKey,
        bundle: &ContextBundle,
        meta: &BundleMeta,
        guard: &str,
    ) -> Result<bool> {
        let bundle_json = serde_json::to_string(bundle)?;
        let meta_json = serde_json::to_string(meta)?;

        let sql = format!(
            r#"
            INSERT INTO context_cache (project, document_type, status, bundle_json, meta_json,
                                       failure_reason, failure_cause, built_at, updated_at)
            VALUES (?, ?, 'READY', ?, ?, NULL, NULL, ?, ?)
            ON CONFLICT(project, document_type) DO UPDATE SET
                status = 'READY',
                bundle_json = excluded.bundle_json,
                meta_json = excluded.meta_json,
                failure_reason = NULL,
                failure_cause = NULL,
                built_at = excluded.built_at,
                updated_at = excluded.updated_at
            {}
            "#,
            guard
        );
        let result = sqlx::query(&sql)
            .bind(&key.project)
            .bind(&key.document_type)
            .bind(&bundle_json)
            .bind(&meta_json)
            .bind(bundle.built_at.timestamp())
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn from_timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn entry_from_row(key: &CacheKey, row: &SqliteRow) -> Result<CacheEntry> {
    let status: String = row.try_get("status")?;
    let bundle_json: Option<String> = row.try_get("bundle_json")?;
    let meta_json: Option<String> = row.try_get("meta_json")?;
    let failure_reason: Option<String> = row.try_get("failure_reason")?;
    let failure_cause: Option<String> = row.try_get("failure_cause")?;
    let built_at: Option<i64> = row.try_get("built_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;

    let bundle = bundle_json
        .map(|json| serde_json::from_str::<ContextBundle>(&json))
        .transpose()
        .with_context(|| format!("Corrupt bundle_json for {}", key))?;
    let meta = meta_json
        .map(|json| serde_json::from_str::<BundleMeta>(&json))
        .transpose()
        .with_context(|| format!("Corrupt meta_json for {}", key))?;
    let failure = match (failure_reason, failure_cause) {
        (Some(reason), cause) => Some(Failure {
            reason,
            cause: cause
                .as_deref()
                .unwrap_or("build_error")
                .parse::<FailureCause>()?,
        }),
        (None, _) => None,
    };

    Ok(CacheEntry {
        key: key.clone(),
        status: status.parse::<BuildStatus>()?,
        bundle,
        meta,
        failure,
        built_at: built_at.map(from_timestamp),
        updated_at: from_timestamp(updated_at),
    })
}

#[async_trait]
impl BuildCache for SqliteBuildCache {
    async fn entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            r#"
            SELECT status, bundle_json, meta_json, failure_reason, failure_cause,
                   built_at, updated_at
            FROM context_cache
            WHERE project = ? AND document_type = ?
            "#,
        )
        .bind(&key.project)
        .bind(&key.document_type)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| entry_from_row(key, &r)).transpose()
    }

    async fn try_begin_build(&self, key: &CacheKey) -> Result<bool> {
        self.transition(key, BuildStatus::Building, "'BUILDING', 'READY'")
            .await
    }

    async fn mark_pending(&self, key: &CacheKey) -> Result<bool> {
        self.transition(key, BuildStatus::Pending, "'BUILDING'").await
    }

    async fn reset_pending(&self, key: &CacheKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE context_cache SET status = 'NONE', updated_at = ?
            WHERE project = ? AND document_type = ? AND status = 'PENDING'
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(&key.project)
        .bind(&key.document_type)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn save(&self, key: &CacheKey, bundle: &ContextBundle, meta: &BundleMeta) -> Result<()> {
        self.store_ready(key, bundle, meta, "").await?;
        Ok(())
    }

    async fn save_override(
        &self,
        key: &CacheKey,
        bundle: &ContextBundle,
        meta: &BundleMeta,
    ) -> Result<bool> {
        self.store_ready(key, bundle, meta, "WHERE context_cache.status != 'BUILDING'")
            .await
    }

    async fn mark_unavailable(
        &self,
        key: &CacheKey,
        reason: &str,
        cause: FailureCause,
    ) -> Result<bool> {
        let sql = if cause == FailureCause::Cleared {
            r#"
            INSERT INTO context_cache (project, document_type, status, failure_reason,
                                       failure_cause, built_at, updated_at)
            VALUES (?, ?, 'FAILED', ?, ?, ?, ?)
            ON CONFLICT(project, document_type) DO UPDATE SET
                status = 'FAILED',
                bundle_json = NULL,
                meta_json = NULL,
                failure_reason = excluded.failure_reason,
                failure_cause = excluded.failure_cause,
                built_at = excluded.built_at,
                updated_at = excluded.updated_at
            WHERE context_cache.status != 'BUILDING'
            "#
        } else {
            r#"
            INSERT INTO context_cache (project, document_type, status, failure_reason,
                                       failure_cause, built_at, updated_at)
            VALUES (?, ?, 'FAILED', ?, ?, ?, ?)
            ON CONFLICT(project, document_type) DO UPDATE SET
                status = 'FAILED',
                failure_reason = excluded.failure_reason,
                failure_cause = excluded.failure_cause,
                built_at = excluded.built_at,
                updated_at = excluded.updated_at
            "#
        };

        let now = Utc::now().timestamp();
        let result = sqlx::query(sql)
            .bind(&key.project)
            .bind(&key.document_type)
            .bind(reason)
            .bind(cause.as_str())
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn expire_builds(&self, started_before: DateTime<Utc>, reason: &str) -> Result<usize> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE context_cache
            SET status = 'FAILED', failure_reason = ?, failure_cause = 'timeout',
                built_at = ?, updated_at = ?
            WHERE status = 'BUILDING' AND updated_at < ?
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(now)
        .bind(started_before.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let result =
            sqlx::query("DELETE FROM context_cache WHERE COALESCE(built_at, updated_at) < ?")
                .bind(cutoff.timestamp())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() as usize)
    }
}
