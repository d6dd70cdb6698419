//! Local store contracts.
//!
//! The sync engine treats persistence as an external collaborator reached
//! through two traits:
//!
//! - [`CatalogStore`]: canonical items (upsert by id) and per-source sync
//!   cursors.
//! - [`HealthStore`]: per-source health counters with atomic increments.
//!
//! [`SqliteStore`] is the production backend; [`InMemoryStore`] backs tests
//! and dry runs. Both are `Send + Sync` and safe to share across concurrent
//! source passes.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::health::{ErrorType, ScraperHealthRecord};
use crate::models::{CanonicalItem, ContentSource};

/// Result of an insert-or-replace by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Stored row already had the same dedup hash.
    Unchanged,
}

/// Number of stored items per source and kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemCount {
    pub source: ContentSource,
    pub kind: String,
    pub count: i64,
}

/// Stored sync watermark of one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncCursor {
    pub source: ContentSource,
    pub last_success_at: DateTime<Utc>,
}

/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_item`](CatalogStore::upsert_item) | Insert or replace an item by id |
/// | [`get_item`](CatalogStore::get_item) | Fetch one item |
/// | [`get_cursor`](CatalogStore::get_cursor) / [`set_cursor`](CatalogStore::set_cursor) | Per-source watermark |
/// | [`count_by_source`](CatalogStore::count_by_source) | Stats |
/// | [`clear_items`](CatalogStore::clear_items) | Explicit cache clear (items and cursors) |
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn upsert_item(&self, item: &CanonicalItem) -> Result<UpsertOutcome>;

    async fn get_item(&self, id: i64) -> Result<Option<CanonicalItem>>;

    async fn get_cursor(&self, source: ContentSource) -> Result<Option<DateTime<Utc>>>;

    async fn set_cursor(&self, source: ContentSource, at: DateTime<Utc>) -> Result<()>;

    async fn list_cursors(&self) -> Result<Vec<SyncCursor>>;

    async fn count_by_source(&self) -> Result<Vec<ItemCount>>;

    /// Delete every item and cursor. Returns the number of items removed.
    async fn clear_items(&self) -> Result<u64>;
}

/// Health counters. Implementations must make each record call a single
/// atomic read-modify-write.
#[async_trait]
pub trait HealthStore: Send + Sync {
    async fn record_success(&self, source: ContentSource, at: DateTime<Utc>) -> Result<()>;

    async fn record_failure(
        &self,
        source: ContentSource,
        at: DateTime<Utc>,
        message: &str,
        error_type: ErrorType,
    ) -> Result<()>;

    async fn get_health(&self, source: ContentSource) -> Result<Option<ScraperHealthRecord>>;

    async fn list_health(&self) -> Result<Vec<ScraperHealthRecord>>;

    /// Delete records whose latest activity is before `before`.
    async fn purge_inactive(&self, before: DateTime<Utc>) -> Result<u64>;

    async fn reset(&self, source: ContentSource) -> Result<()>;
}
