use anyhow::Result;

use crate::config::Config;
use crate::db;

/// Create the schema. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // Canonical items, keyed by stable id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS catalog_items (
            id INTEGER PRIMARY KEY,
            source TEXT NOT NULL,
            kind TEXT NOT NULL,
            slug TEXT NOT NULL,
            title TEXT NOT NULL,
            source_page_url TEXT NOT NULL,
            effective_at INTEGER,
            payload_json TEXT NOT NULL,
            dedup_hash TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Per-source delta-sync watermark
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_cursors (
            source TEXT PRIMARY KEY,
            last_success_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scraper_health (
            source TEXT PRIMARY KEY,
            success_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            last_success_at INTEGER,
            last_error_at INTEGER,
            last_error_message TEXT,
            last_error_type TEXT
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_catalog_items_source ON catalog_items(source, kind)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_catalog_items_effective_at ON catalog_items(effective_at DESC)",
    )
    .execute(&pool)
    .await?;

    pool.close().await;
    Ok(())
}
