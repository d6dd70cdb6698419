//! In-memory store for tests and dry runs.
//!
//! Maps behind `parking_lot::RwLock`; each trait call takes one write lock,
//! which makes counter increments atomic.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::health::{ErrorType, ScraperHealthRecord};
use crate::models::{CanonicalItem, ContentSource};

use super::{CatalogStore, HealthStore, ItemCount, SyncCursor, UpsertOutcome};

struct StoredItem {
    item: CanonicalItem,
    dedup_hash: String,
}

#[derive(Default)]
pub struct InMemoryStore {
    items: RwLock<HashMap<i64, StoredItem>>,
    cursors: RwLock<HashMap<ContentSource, DateTime<Utc>>>,
    health: RwLock<HashMap<ContentSource, ScraperHealthRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item_count(&self) -> usize {
        self.items.read().len()
    }
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn upsert_item(&self, item: &CanonicalItem) -> Result<UpsertOutcome> {
        let hash = item.dedup_hash();
        let mut items = self.items.write();
        let outcome = match items.get(&item.id) {
            Some(existing) if existing.dedup_hash == hash => return Ok(UpsertOutcome::Unchanged),
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        };
        items.insert(
            item.id,
            StoredItem {
                item: item.clone(),
                dedup_hash: hash,
            },
        );
        Ok(outcome)
    }

    async fn get_item(&self, id: i64) -> Result<Option<CanonicalItem>> {
        Ok(self.items.read().get(&id).map(|s| s.item.clone()))
    }

    async fn get_cursor(&self, source: ContentSource) -> Result<Option<DateTime<Utc>>> {
        Ok(self.cursors.read().get(&source).copied())
    }

    async fn set_cursor(&self, source: ContentSource, at: DateTime<Utc>) -> Result<()> {
        self.cursors.write().insert(source, at);
        Ok(())
    }

    async fn list_cursors(&self) -> Result<Vec<SyncCursor>> {
        let mut cursors: Vec<SyncCursor> = self
            .cursors
            .read()
            .iter()
            .map(|(source, at)| SyncCursor {
                source: *source,
                last_success_at: *at,
            })
            .collect();
        cursors.sort_by_key(|c| c.source);
        Ok(cursors)
    }

    async fn count_by_source(&self) -> Result<Vec<ItemCount>> {
        let mut counts: HashMap<(ContentSource, &'static str), i64> = HashMap::new();
        for stored in self.items.read().values() {
            *counts
                .entry((stored.item.source, stored.item.kind.label()))
                .or_default() += 1;
        }
        let mut out: Vec<ItemCount> = counts
            .into_iter()
            .map(|((source, kind), count)| ItemCount {
                source,
                kind: kind.to_string(),
                count,
            })
            .collect();
        out.sort_by(|a, b| (a.source, &a.kind).cmp(&(b.source, &b.kind)));
        Ok(out)
    }

    async fn clear_items(&self) -> Result<u64> {
        let removed = {
            let mut items = self.items.write();
            let n = items.len() as u64;
            items.clear();
            n
        };
        self.cursors.write().clear();
        Ok(removed)
    }
}

#[async_trait]
impl HealthStore for InMemoryStore {
    async fn record_success(&self, source: ContentSource, at: DateTime<Utc>) -> Result<()> {
        let mut health = self.health.write();
        let record = health
            .entry(source)
            .or_insert_with(|| ScraperHealthRecord::empty(source));
        record.success_count += 1;
        record.last_success_at = Some(at);
        Ok(())
    }

    async fn record_failure(
        &self,
        source: ContentSource,
        at: DateTime<Utc>,
        message: &str,
        error_type: ErrorType,
    ) -> Result<()> {
        let mut health = self.health.write();
        let record = health
            .entry(source)
            .or_insert_with(|| ScraperHealthRecord::empty(source));
        record.failure_count += 1;
        record.last_error_at = Some(at);
        record.last_error_message = Some(message.to_string());
        record.last_error_type = Some(error_type);
        Ok(())
    }

    async fn get_health(&self, source: ContentSource) -> Result<Option<ScraperHealthRecord>> {
        Ok(self.health.read().get(&source).cloned())
    }

    async fn list_health(&self) -> Result<Vec<ScraperHealthRecord>> {
        let mut records: Vec<ScraperHealthRecord> = self.health.read().values().cloned().collect();
        records.sort_by_key(|r| r.source);
        Ok(records)
    }

    async fn purge_inactive(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut health = self.health.write();
        let len = health.len();
        health.retain(|_, record| record.last_activity().is_some_and(|at| at >= before));
        Ok((len - health.len()) as u64)
    }

    async fn reset(&self, source: ContentSource) -> Result<()> {
        self.health.write().remove(&source);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentKind;

    fn item(slug: &str) -> CanonicalItem {
        CanonicalItem::new(
            ContentSource::ScrapedCatalog,
            ContentKind::Movie,
            slug,
            "Title",
            &format!("https://namakade.com/movies/{}", slug),
        )
    }

    #[tokio::test]
    async fn upsert_reports_insert_update_unchanged() {
        let store = InMemoryStore::new();
        let mut film = item("film");
        assert_eq!(store.upsert_item(&film).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert_item(&film).await.unwrap(), UpsertOutcome::Unchanged);
        film.title = "New Title".to_string();
        assert_eq!(store.upsert_item(&film).await.unwrap(), UpsertOutcome::Updated);
        assert_eq!(store.item_count(), 1);
        assert_eq!(
            store.get_item(film.id).await.unwrap().unwrap().title,
            "New Title"
        );
    }

    #[tokio::test]
    async fn clear_removes_items_and_cursors() {
        let store = InMemoryStore::new();
        store.upsert_item(&item("a")).await.unwrap();
        store.upsert_item(&item("b")).await.unwrap();
        store
            .set_cursor(ContentSource::ScrapedCatalog, Utc::now())
            .await
            .unwrap();
        let counts = store.count_by_source().await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].count, 2);
        assert_eq!(store.clear_items().await.unwrap(), 2);
        assert!(store
            .get_cursor(ContentSource::ScrapedCatalog)
            .await
            .unwrap()
            .is_none());
    }
}
