//! `catsync sources`: configured sources and their health at a glance.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::config::Config;
use crate::health::{HealthPolicy, HealthTracker, ScraperHealthRecord};
use crate::models::ContentSource;
use crate::security::SecurityGate;
use crate::store::SqliteStore;
use crate::traits::AdapterRegistry;

/// One row of the sources table.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceStatus {
    pub source: ContentSource,
    pub description: String,
    pub base_url: String,
    pub status: &'static str,
    pub success_rate: f64,
}

/// Status label for a health record.
pub fn status_label(record: &ScraperHealthRecord, policy: &HealthPolicy) -> &'static str {
    if record.has_no_data() {
        "NO DATA"
    } else if !record.is_healthy(policy) {
        "UNHEALTHY"
    } else if record.is_stale(policy, Utc::now()) {
        "STALE"
    } else {
        "OK"
    }
}

pub async fn source_statuses(config: &Config, health: Arc<HealthTracker>) -> Result<Vec<SourceStatus>> {
    let gate = Arc::new(SecurityGate::new(&config.security.allowed_domains));
    let registry = AdapterRegistry::from_config(config, gate, Arc::clone(&health))?;

    let mut rows = Vec::new();
    for adapter in registry.list() {
        let source = adapter.source();
        let record = health.get_health(source).await?;
        rows.push(SourceStatus {
            source,
            description: adapter.description().to_string(),
            base_url: config
                .sources
                .base_url(source)
                .unwrap_or_default()
                .to_string(),
            status: status_label(&record, health.policy()),
            success_rate: record.success_rate(),
        });
    }
    rows.sort_by_key(|r| r.source);
    Ok(rows)
}

pub async fn list_sources(config: &Config) -> Result<()> {
    let store = Arc::new(SqliteStore::open(config).await?);
    let health = Arc::new(HealthTracker::new(
        store.clone(),
        HealthPolicy::from(&config.health),
    ));
    let rows = source_statuses(config, health).await?;
    store.pool().close().await;

    if rows.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }

    println!(
        "{:<24} {:<10} {:>7}  {:<32} DESCRIPTION",
        "SOURCE", "STATUS", "RATE", "BASE URL"
    );
    for row in &rows {
        println!(
            "{:<24} {:<10} {:>6.1}%  {:<32} {}",
            row.source.as_str(),
            row.status,
            row.success_rate * 100.0,
            row.base_url,
            row.description
        );
    }

    Ok(())
}
