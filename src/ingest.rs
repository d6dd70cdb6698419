//! Sync orchestration.
//!
//! Drives each configured source through one pass:
//!
//! ```text
//! cursor ──▶ adapter.fetch_candidates ──▶ select_changed ──▶ upsert ──▶ advance cursor
//!                      │                                                  ▲
//!                      └──────── any error: health failure, cursor kept ──┘
//! ```
//!
//! An item is selected iff its effective timestamp (`modified ?? published`)
//! is after the stored cursor. The cursor moves to the pass's fetch time only
//! when the pass finished with no adapter error, so a failed or partial pass
//! is retried in full on the next trigger.
//!
//! Sources run concurrently (bounded by `sync.max_concurrent_sources`); each
//! source has its own lock, so two passes for the same source never overlap.
//! A source that is already syncing reports `skipped`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{Config, SyncConfig};
use crate::health::{HealthPolicy, HealthTracker};
use crate::models::{CanonicalItem, ContentSource};
use crate::progress::{NoProgress, ProgressMode, SyncProgressEvent, SyncProgressReporter};
use crate::security::SecurityGate;
use crate::store::{CatalogStore, SqliteStore, UpsertOutcome};
use crate::traits::AdapterRegistry;

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Ignore the stored cursor and consider every fetched item.
    pub full: bool,
    /// Fetch and select, but neither upsert nor move the cursor.
    pub dry_run: bool,
    /// Upsert at most this many selected items. A truncated pass keeps its cursor.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Completed,
    /// Some pages failed; what was obtained is stored, the cursor is kept.
    Partial,
    Failed,
    /// Another pass for the same source was running.
    Skipped,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Completed => "completed",
            SyncStatus::Partial => "partial",
            SyncStatus::Failed => "failed",
            SyncStatus::Skipped => "skipped",
        }
    }
}

/// Outcome of one source pass.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSyncReport {
    pub source: ContentSource,
    pub cutoff: Option<DateTime<Utc>>,
    pub fetched: usize,
    pub selected: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub dropped: usize,
    pub errors: Vec<String>,
    pub cursor_advanced_to: Option<DateTime<Utc>>,
    pub status: SyncStatus,
}

impl SourceSyncReport {
    fn new(source: ContentSource, cutoff: Option<DateTime<Utc>>, status: SyncStatus) -> Self {
        Self {
            source,
            cutoff,
            fetched: 0,
            selected: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            dropped: 0,
            errors: Vec::new(),
            cursor_advanced_to: None,
            status,
        }
    }

    fn failed(source: ContentSource, message: String) -> Self {
        let mut report = Self::new(source, None, SyncStatus::Failed);
        report.errors.push(message);
        report
    }
}

/// Items whose effective timestamp is after `cutoff`.
///
/// Items carrying neither a modified nor a published timestamp are treated
/// as modified at `fetched_at`, which is always after a cursor set by an
/// earlier pass.
pub fn select_changed(
    items: Vec<CanonicalItem>,
    cutoff: Option<DateTime<Utc>>,
    fetched_at: DateTime<Utc>,
    modified_fallback: bool,
) -> Vec<CanonicalItem> {
    let Some(cutoff) = cutoff else {
        return items;
    };
    items
        .into_iter()
        .filter(|item| {
            item.effective_modified_at(modified_fallback)
                .unwrap_or(fetched_at)
                > cutoff
        })
        .collect()
}

pub struct SyncOrchestrator {
    registry: AdapterRegistry,
    store: Arc<dyn CatalogStore>,
    health: Arc<HealthTracker>,
    settings: SyncConfig,
    locks: HashMap<ContentSource, Arc<tokio::sync::Mutex<()>>>,
    progress: Arc<dyn SyncProgressReporter>,
}

impl SyncOrchestrator {
    pub fn new(
        registry: AdapterRegistry,
        store: Arc<dyn CatalogStore>,
        health: Arc<HealthTracker>,
        settings: SyncConfig,
    ) -> Self {
        let locks = ContentSource::ALL
            .iter()
            .map(|source| (*source, Arc::new(tokio::sync::Mutex::new(()))))
            .collect();
        Self {
            registry,
            store,
            health,
            settings,
            locks,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Run one pass for `source`.
    ///
    /// Adapter failures are recorded in health and returned as a `failed`
    /// report; `Err` is reserved for local store failures.
    pub async fn sync_source(
        &self,
        source: ContentSource,
        options: &SyncOptions,
    ) -> Result<SourceSyncReport> {
        let Some(adapter) = self.registry.get(source) else {
            bail!("Source '{}' is not configured", source);
        };
        let Some(lock) = self.locks.get(&source) else {
            bail!("No sync lock for source '{}'", source);
        };
        let Ok(_guard) = lock.try_lock() else {
            info!(source = %source, "pass already running, skipping");
            return Ok(SourceSyncReport::new(source, None, SyncStatus::Skipped));
        };

        let fetched_at = Utc::now();
        let cutoff = if options.full {
            None
        } else {
            self.store.get_cursor(source).await?
        };
        let mut report = SourceSyncReport::new(source, cutoff, SyncStatus::Completed);

        self.progress.report(SyncProgressEvent::Fetching { source });
        let harvest = match adapter.fetch_candidates(cutoff).await {
            Ok(harvest) => harvest,
            Err(err) => {
                warn!(source = %source, error = %err, "pass failed, cursor kept");
                self.record_error(source, &err).await;
                report.status = SyncStatus::Failed;
                report.errors.push(err.to_string());
                self.finish(&report);
                return Ok(report);
            }
        };

        report.fetched = harvest.items.len();
        report.dropped = harvest.dropped;
        report.errors = harvest.errors.iter().map(ToString::to_string).collect();

        let mut selected = select_changed(
            harvest.items,
            cutoff,
            fetched_at,
            self.settings.modified_fallback,
        );
        report.selected = selected.len();
        let truncated = match options.limit {
            Some(limit) if selected.len() > limit => {
                selected.truncate(limit);
                true
            }
            _ => false,
        };

        if !options.dry_run {
            let total = selected.len() as u64;
            for (n, item) in selected.iter().enumerate() {
                match self.store.upsert_item(item).await? {
                    UpsertOutcome::Inserted => report.inserted += 1,
                    UpsertOutcome::Updated => report.updated += 1,
                    UpsertOutcome::Unchanged => report.unchanged += 1,
                }
                self.progress.report(SyncProgressEvent::Upserting {
                    source,
                    n: n as u64 + 1,
                    total,
                });
            }
        }

        match harvest.errors.first() {
            Some(first) => {
                report.status = SyncStatus::Partial;
                warn!(
                    source = %source,
                    errors = harvest.errors.len(),
                    "partial pass, cursor kept"
                );
                self.record_error(source, first).await;
            }
            None => {
                if let Err(e) = self.health.record_success(source).await {
                    warn!(error = %e, "failed to record health");
                }
                if !options.dry_run && !truncated {
                    self.store.set_cursor(source, fetched_at).await?;
                    report.cursor_advanced_to = Some(fetched_at);
                }
            }
        }

        info!(
            source = %source,
            fetched = report.fetched,
            selected = report.selected,
            inserted = report.inserted,
            updated = report.updated,
            status = report.status.as_str(),
            "pass finished"
        );
        self.finish(&report);
        Ok(report)
    }

    /// Run every registered source, isolated from one another.
    pub async fn sync_all(&self, options: &SyncOptions) -> Vec<SourceSyncReport> {
        let sources: Vec<ContentSource> = self.registry.list().iter().map(|a| a.source()).collect();
        let limit = self.settings.max_concurrent_sources.max(1);

        let mut reports: Vec<SourceSyncReport> = stream::iter(sources)
            .map(|source| async move {
                let span = info_span!("source", source = %source);
                match self.sync_source(source, options).instrument(span).await {
                    Ok(report) => report,
                    Err(e) => {
                        warn!(source = %source, error = %e, "pass aborted");
                        SourceSyncReport::failed(source, format!("{:#}", e))
                    }
                }
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        reports.sort_by_key(|r| r.source);
        reports
    }

    async fn record_error(&self, source: ContentSource, err: &crate::error::FetchError) {
        if let Err(e) = self.health.record_error(source, err).await {
            warn!(error = %e, "failed to record health");
        }
    }

    fn finish(&self, report: &SourceSyncReport) {
        self.progress.report(SyncProgressEvent::Finished {
            source: report.source,
            status: report.status.as_str(),
        });
    }
}

/// `catsync sync <all|source>`.
pub async fn run_sync(
    config: &Config,
    target: &str,
    options: SyncOptions,
    progress: ProgressMode,
    json: bool,
) -> Result<()> {
    let run_id = Uuid::new_v4();
    let span = info_span!("sync", run_id = %run_id, sync_target = target);

    async move {
        let store = Arc::new(SqliteStore::open(config).await?);
        let health = Arc::new(HealthTracker::new(
            store.clone(),
            HealthPolicy::from(&config.health),
        ));
        let gate = Arc::new(SecurityGate::new(&config.security.allowed_domains));
        let registry = AdapterRegistry::from_config(config, gate, Arc::clone(&health))?;
        if registry.is_empty() {
            bail!("No sources configured. Add a [sources.*] table to the config file.");
        }

        let orchestrator =
            SyncOrchestrator::new(registry, store.clone(), health, config.sync.clone())
                .with_progress(progress.reporter());

        let reports = if target == "all" {
            orchestrator.sync_all(&options).await
        } else {
            let source: ContentSource = target.parse()?;
            vec![orchestrator.sync_source(source, &options).await?]
        };

        if json {
            println!("{}", serde_json::to_string_pretty(&reports)?);
        } else {
            for report in &reports {
                print_report(report, options.dry_run);
            }
        }

        store.pool().close().await;

        let failed = reports
            .iter()
            .filter(|r| r.status == SyncStatus::Failed)
            .count();
        if failed > 0 {
            bail!("{} of {} source(s) failed", failed, reports.len());
        }
        println!("ok");
        Ok(())
    }
    .instrument(span)
    .await
}

fn print_report(report: &SourceSyncReport, dry_run: bool) {
    if dry_run {
        println!("sync {} (dry-run)", report.source);
    } else {
        println!("sync {}", report.source);
    }
    match report.cutoff {
        Some(cutoff) => println!("  cutoff: {}", cutoff.to_rfc3339()),
        None => println!("  cutoff: none (full)"),
    }
    println!("  fetched: {} items", report.fetched);
    println!("  selected: {}", report.selected);
    if !dry_run {
        println!(
            "  upserted: {} new, {} updated, {} unchanged",
            report.inserted, report.updated, report.unchanged
        );
    }
    if report.dropped > 0 {
        println!("  dropped: {}", report.dropped);
    }
    for error in &report.errors {
        println!("  error: {}", error);
    }
    match report.cursor_advanced_to {
        Some(at) => println!("  cursor: {}", at.to_rfc3339()),
        None => println!("  cursor: unchanged"),
    }
    println!("  status: {}", report.status.as_str());
}
