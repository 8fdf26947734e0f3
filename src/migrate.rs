use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates the cache schema on an open pool. Safe to run repeatedly.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // One row per (project, document_type); status doubles as the build lock
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS context_cache (
            project TEXT NOT NULL,
            document_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'NONE',
            bundle_json TEXT,
            meta_json TEXT,
            failure_reason TEXT,
            failure_cause TEXT,
            built_at INTEGER,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (project, document_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_context_cache_built_at ON context_cache(built_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_context_cache_status ON context_cache(status)")
        .execute(pool)
        .await?;

    Ok(())
}
