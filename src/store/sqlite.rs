//! SQLite-backed store.
//!
//! Items are stored as a JSON payload plus the indexed columns needed for
//! stats and dedup. Timestamps are Unix milliseconds. Health counters are
//! incremented inside a single `INSERT ... ON CONFLICT DO UPDATE`, so
//! concurrent writers never lose an update.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::health::{ErrorType, ScraperHealthRecord};
use crate::models::{CanonicalItem, ContentSource};

use super::{CatalogStore, HealthStore, ItemCount, SyncCursor, UpsertOutcome};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database. The schema must already exist.
    pub async fn open(config: &Config) -> Result<Self> {
        Ok(Self::new(db::connect(config).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

fn parse_source(label: &str) -> Result<ContentSource> {
    label
        .parse()
        .with_context(|| format!("Unknown source in database: '{}'", label))
}

fn health_from_row(row: &SqliteRow) -> Result<ScraperHealthRecord> {
    let source: String = row.try_get("source")?;
    let success_count: i64 = row.try_get("success_count")?;
    let failure_count: i64 = row.try_get("failure_count")?;
    let last_success_at: Option<i64> = row.try_get("last_success_at")?;
    let last_error_at: Option<i64> = row.try_get("last_error_at")?;
    let last_error_type: Option<String> = row.try_get("last_error_type")?;
    Ok(ScraperHealthRecord {
        source: parse_source(&source)?,
        success_count: success_count.max(0) as u64,
        failure_count: failure_count.max(0) as u64,
        last_success_at: last_success_at.and_then(from_millis),
        last_error_at: last_error_at.and_then(from_millis),
        last_error_message: row.try_get("last_error_message")?,
        last_error_type: last_error_type.as_deref().map(ErrorType::from_label),
    })
}

#[async_trait]
impl CatalogStore for SqliteStore {
    async fn upsert_item(&self, item: &CanonicalItem) -> Result<UpsertOutcome> {
        let hash = item.dedup_hash();
        let payload = serde_json::to_string(item)?;
        let mut tx = self.pool.begin().await?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT dedup_hash FROM catalog_items WHERE id = ?")
                .bind(item.id)
                .fetch_optional(&mut *tx)
                .await?;

        let outcome = match existing {
            Some(ref stored) if *stored == hash => {
                tx.commit().await?;
                return Ok(UpsertOutcome::Unchanged);
            }
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        };

        sqlx::query(
            r#"
            INSERT INTO catalog_items (id, source, kind, slug, title, source_page_url,
                                       effective_at, payload_json, dedup_hash, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                source = excluded.source,
                kind = excluded.kind,
                slug = excluded.slug,
                title = excluded.title,
                source_page_url = excluded.source_page_url,
                effective_at = excluded.effective_at,
                payload_json = excluded.payload_json,
                dedup_hash = excluded.dedup_hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(item.id)
        .bind(item.source.as_str())
        .bind(item.kind.label())
        .bind(&item.slug)
        .bind(&item.title)
        .bind(&item.source_page_url)
        .bind(item.effective_modified_at(true).map(to_millis))
        .bind(&payload)
        .bind(&hash)
        .bind(to_millis(Utc::now()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn get_item(&self, id: i64) -> Result<Option<CanonicalItem>> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload_json FROM catalog_items WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        payload
            .map(|json| {
                serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt payload for item {}", id))
            })
            .transpose()
    }

    async fn get_cursor(&self, source: ContentSource) -> Result<Option<DateTime<Utc>>> {
        let ms: Option<i64> =
            sqlx::query_scalar("SELECT last_success_at FROM sync_cursors WHERE source = ?")
                .bind(source.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(ms.and_then(from_millis))
    }

    async fn set_cursor(&self, source: ContentSource, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (source, last_success_at, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET
                last_success_at = excluded.last_success_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(source.as_str())
        .bind(to_millis(at))
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_cursors(&self) -> Result<Vec<SyncCursor>> {
        let rows = sqlx::query("SELECT source, last_success_at FROM sync_cursors ORDER BY source")
            .fetch_all(&self.pool)
            .await?;
        let mut cursors = Vec::with_capacity(rows.len());
        for row in rows {
            let source: String = row.try_get("source")?;
            let ms: i64 = row.try_get("last_success_at")?;
            if let Some(last_success_at) = from_millis(ms) {
                cursors.push(SyncCursor {
                    source: parse_source(&source)?,
                    last_success_at,
                });
            }
        }
        Ok(cursors)
    }

    async fn count_by_source(&self) -> Result<Vec<ItemCount>> {
        let rows = sqlx::query(
            "SELECT source, kind, COUNT(*) AS n FROM catalog_items GROUP BY source, kind ORDER BY source, kind",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<ItemCount> {
                let source: String = row.try_get("source")?;
                Ok(ItemCount {
                    source: parse_source(&source)?,
                    kind: row.try_get("kind")?,
                    count: row.try_get("n")?,
                })
            })
            .collect()
    }

    async fn clear_items(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM catalog_items")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM sync_cursors")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }
}

#[async_trait]
impl HealthStore for SqliteStore {
    async fn record_success(&self, source: ContentSource, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scraper_health (source, success_count, failure_count, last_success_at)
            VALUES (?, 1, 0, ?)
            ON CONFLICT(source) DO UPDATE SET
                success_count = success_count + 1,
                last_success_at = excluded.last_success_at
            "#,
        )
        .bind(source.as_str())
        .bind(to_millis(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        source: ContentSource,
        at: DateTime<Utc>,
        message: &str,
        error_type: ErrorType,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scraper_health (source, success_count, failure_count, last_error_at,
                                        last_error_message, last_error_type)
            VALUES (?, 0, 1, ?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET
                failure_count = failure_count + 1,
                last_error_at = excluded.last_error_at,
                last_error_message = excluded.last_error_message,
                last_error_type = excluded.last_error_type
            "#,
        )
        .bind(source.as_str())
        .bind(to_millis(at))
        .bind(message)
        .bind(error_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_health(&self, source: ContentSource) -> Result<Option<ScraperHealthRecord>> {
        let row = sqlx::query("SELECT * FROM scraper_health WHERE source = ?")
            .bind(source.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(health_from_row).transpose()
    }

    async fn list_health(&self) -> Result<Vec<ScraperHealthRecord>> {
        let rows = sqlx::query("SELECT * FROM scraper_health ORDER BY source")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(health_from_row).collect()
    }

    async fn purge_inactive(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM scraper_health WHERE MAX(COALESCE(last_success_at, 0), COALESCE(last_error_at, 0)) < ?",
        )
        .bind(to_millis(before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reset(&self, source: ContentSource) -> Result<()> {
        sqlx::query("DELETE FROM scraper_health WHERE source = ?")
            .bind(source.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
