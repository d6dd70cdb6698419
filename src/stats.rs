//! Store statistics and health overview.
//!
//! Summarizes what the local catalog holds: item counts per source and
//! kind, each source's sync cursor, and the health summary. Used by
//! `catsync stats` to confirm that syncs are landing.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::health::{HealthPolicy, HealthTracker};
use crate::models::ContentSource;
use crate::store::{CatalogStore, ItemCount, SqliteStore, SyncCursor};

/// Per-source item counts and cursor.
#[derive(Debug, Clone, Default, PartialEq)]
struct SourceStats {
    movies: i64,
    series: i64,
    episodes: i64,
    cursor: Option<DateTime<Utc>>,
}

impl SourceStats {
    fn total(&self) -> i64 {
        self.movies + self.series + self.episodes
    }
}

fn group_by_source(
    counts: &[ItemCount],
    cursors: &[SyncCursor],
) -> BTreeMap<ContentSource, SourceStats> {
    let mut by_source: BTreeMap<ContentSource, SourceStats> = BTreeMap::new();
    for count in counts {
        let stats = by_source.entry(count.source).or_default();
        match count.kind.as_str() {
            "movie" => stats.movies += count.count,
            "series" => stats.series += count.count,
            _ => stats.episodes += count.count,
        }
    }
    for cursor in cursors {
        by_source.entry(cursor.source).or_default().cursor = Some(cursor.last_success_at);
    }
    by_source
}

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = Arc::new(SqliteStore::open(config).await?);
    let health = HealthTracker::new(store.clone(), HealthPolicy::from(&config.health));

    let counts = store.count_by_source().await?;
    let cursors = store.list_cursors().await?;
    let summary = health.summary().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);
    let by_source = group_by_source(&counts, &cursors);
    let total: i64 = by_source.values().map(SourceStats::total).sum();

    println!("catalog-sync: store stats");
    println!("=========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Items:       {}", total);

    if !by_source.is_empty() {
        println!();
        println!("  By source:");
        println!(
            "  {:<24} {:>7} {:>7} {:>9}   {}",
            "SOURCE", "MOVIES", "SERIES", "EPISODES", "CURSOR"
        );
        println!("  {}", "-".repeat(72));

        for (source, s) in &by_source {
            let cursor_display = match s.cursor {
                Some(at) => format_relative(at, Utc::now()),
                None => "never".to_string(),
            };
            println!(
                "  {:<24} {:>7} {:>7} {:>9}   {}",
                source.as_str(),
                s.movies,
                s.series,
                s.episodes,
                cursor_display
            );
        }
    }

    println!();
    println!(
        "  Health:      {} tracked, {} healthy, {} unhealthy, {} stale, {} without data",
        summary.tracked, summary.healthy, summary.unhealthy, summary.stale, summary.no_data
    );
    println!();

    store.pool().close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" style rendering; falls back to a date past 30 days.
fn format_relative(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - at).num_seconds();

    if delta < 0 {
        return at.format("%Y-%m-%d %H:%M").to_string();
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        at.format("%Y-%m-%d %H:%M").to_string()
    }
}
