//! Per-source health and reliability tracking.
//!
//! Every adapter invocation ends in exactly one `record_success` or
//! `record_failure` for its [`ContentSource`]. Counters live in a
//! [`HealthStore`] whose increments are atomic, so concurrent sources (and
//! overlapping requests of one source) never lose updates.
//!
//! | Derived flag | Rule |
//! |--------------|------|
//! | `success_rate` | `success / (success + failure)`, `1.0` with no data |
//! | healthy | `success_rate >= healthy_threshold` (0.70) |
//! | stale | had a success, but none in `stale_after` (24h) |
//! | no data | nothing recorded at all |
//!
//! [`HealthTracker::get_unhealthy_scrapers`] is cached for `cache_ttl`
//! (30s); any write through the tracker invalidates the cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::HealthConfig;
use crate::error::FetchError;
use crate::models::ContentSource;
use crate::store::HealthStore;

/// Maximum stored length of `last_error_message`, in characters.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Network,
    Parse,
    Timeout,
    Security,
    Unknown,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Network => "network",
            ErrorType::Parse => "parse",
            ErrorType::Timeout => "timeout",
            ErrorType::Security => "security",
            ErrorType::Unknown => "unknown",
        }
    }

    /// Lenient inverse of [`ErrorType::as_str`]; unrecognized labels are `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label {
            "network" => ErrorType::Network,
            "parse" => ErrorType::Parse,
            "timeout" => ErrorType::Timeout,
            "security" => ErrorType::Security,
            _ => ErrorType::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a free-text failure message by keyword.
pub fn classify_error(message: &str) -> ErrorType {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["timed out", "timeout", "deadline"]) {
        ErrorType::Timeout
    } else if has(&[
        "security",
        "cleartext",
        "untrusted",
        "certificate",
        "ssl",
        "tls",
    ]) {
        ErrorType::Security
    } else if has(&["parse", "selector", "malformed", "unexpected", "invalid xml", "json"]) {
        ErrorType::Parse
    } else if has(&[
        "network",
        "connection",
        "connect",
        "dns",
        "unreachable",
        "http ",
        "request failed",
    ]) {
        ErrorType::Network
    } else {
        ErrorType::Unknown
    }
}

/// Cut a message to [`MAX_ERROR_MESSAGE_CHARS`] on a character boundary.
pub fn truncate_message(message: &str) -> String {
    message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}

/// Thresholds that turn raw counters into health flags.
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub healthy_threshold: f64,
    pub stale_after: chrono::Duration,
    pub retention: chrono::Duration,
    pub cache_ttl: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

impl From<&HealthConfig> for HealthPolicy {
    fn from(config: &HealthConfig) -> Self {
        Self {
            healthy_threshold: config.healthy_threshold,
            stale_after: chrono::Duration::hours(config.stale_after_hours),
            retention: chrono::Duration::days(config.retention_days),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScraperHealthRecord {
    pub source: ContentSource,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub last_error_type: Option<ErrorType>,
}

impl ScraperHealthRecord {
    pub fn empty(source: ContentSource) -> Self {
        Self {
            source,
            success_count: 0,
            failure_count: 0,
            last_success_at: None,
            last_error_at: None,
            last_error_message: None,
            last_error_type: None,
        }
    }

    pub fn total(&self) -> u64 {
        self.success_count + self.failure_count
    }

    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 1.0,
            total => self.success_count as f64 / total as f64,
        }
    }

    pub fn is_healthy(&self, policy: &HealthPolicy) -> bool {
        self.success_rate() >= policy.healthy_threshold
    }

    pub fn is_stale(&self, policy: &HealthPolicy, now: DateTime<Utc>) -> bool {
        matches!(self.last_success_at, Some(at) if now - at > policy.stale_after)
    }

    pub fn has_no_data(&self) -> bool {
        self.total() == 0 && self.last_success_at.is_none()
    }

    /// Most recent success or failure.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_success_at.max(self.last_error_at)
    }

    /// Tracked and either unhealthy or stale.
    pub fn needs_attention(&self, policy: &HealthPolicy, now: DateTime<Utc>) -> bool {
        !self.has_no_data() && (!self.is_healthy(policy) || self.is_stale(policy, now))
    }
}

/// Counts across every known source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub tracked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub stale: usize,
    pub no_data: usize,
}

/// Cached unhealthy list. `generation` moves on every write, so a list read
/// before a write can never be stored after it.
#[derive(Default)]
struct UnhealthyCache {
    generation: u64,
    entry: Option<(Instant, Vec<ScraperHealthRecord>)>,
}

pub struct HealthTracker {
    store: Arc<dyn HealthStore>,
    policy: HealthPolicy,
    unhealthy_cache: Mutex<UnhealthyCache>,
}

impl HealthTracker {
    pub fn new(store: Arc<dyn HealthStore>, policy: HealthPolicy) -> Self {
        Self {
            store,
            policy,
            unhealthy_cache: Mutex::new(UnhealthyCache::default()),
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    fn invalidate(&self) {
        let mut cache = self.unhealthy_cache.lock();
        cache.generation = cache.generation.wrapping_add(1);
        cache.entry = None;
    }

    pub async fn record_success(&self, source: ContentSource) -> Result<()> {
        self.store.record_success(source, Utc::now()).await?;
        self.invalidate();
        debug!(source = %source, "health: success");
        Ok(())
    }

    /// Record a failure; the message is truncated and classified by keyword.
    pub async fn record_failure(&self, source: ContentSource, message: Option<&str>) -> Result<()> {
        let message = message.unwrap_or("unknown error");
        self.write_failure(source, message, classify_error(message))
            .await
    }

    /// Record a failure, classified by the error variant first.
    pub async fn record_error(&self, source: ContentSource, error: &FetchError) -> Result<()> {
        let message = error.to_string();
        let error_type = match error {
            FetchError::Network(msg) if classify_error(msg) == ErrorType::Timeout => {
                ErrorType::Timeout
            }
            FetchError::Network(_) => ErrorType::Network,
            FetchError::Parse(_) => ErrorType::Parse,
            FetchError::Security(_) => ErrorType::Security,
            FetchError::Auth(_) => match classify_error(&message) {
                ErrorType::Parse => ErrorType::Unknown,
                other => other,
            },
        };
        self.write_failure(source, &message, error_type).await
    }

    async fn write_failure(
        &self,
        source: ContentSource,
        message: &str,
        error_type: ErrorType,
    ) -> Result<()> {
        let message = truncate_message(message);
        self.store
            .record_failure(source, Utc::now(), &message, error_type)
            .await?;
        self.invalidate();
        debug!(source = %source, error_type = %error_type, "health: failure");
        Ok(())
    }

    /// The record for `source`, or an empty one if nothing was recorded.
    pub async fn get_health(&self, source: ContentSource) -> Result<ScraperHealthRecord> {
        Ok(self
            .store
            .get_health(source)
            .await?
            .unwrap_or_else(|| ScraperHealthRecord::empty(source)))
    }

    /// One record per known source, in declaration order.
    pub async fn get_all_health(&self) -> Result<Vec<ScraperHealthRecord>> {
        let stored = self.store.list_health().await?;
        Ok(ContentSource::ALL
            .iter()
            .map(|source| {
                stored
                    .iter()
                    .find(|r| r.source == *source)
                    .cloned()
                    .unwrap_or_else(|| ScraperHealthRecord::empty(*source))
            })
            .collect())
    }

    /// Tracked sources that are unhealthy or stale. Cached for `cache_ttl`.
    pub async fn get_unhealthy_scrapers(&self) -> Result<Vec<ScraperHealthRecord>> {
        let generation = {
            let cache = self.unhealthy_cache.lock();
            if let Some((_, records)) = cache
                .entry
                .as_ref()
                .filter(|(at, _)| at.elapsed() < self.policy.cache_ttl)
            {
                return Ok(records.clone());
            }
            cache.generation
        };

        let now = Utc::now();
        let unhealthy: Vec<ScraperHealthRecord> = self
            .store
            .list_health()
            .await?
            .into_iter()
            .filter(|r| r.needs_attention(&self.policy, now))
            .collect();

        let mut cache = self.unhealthy_cache.lock();
        if cache.generation == generation {
            cache.entry = Some((Instant::now(), unhealthy.clone()));
        } else {
            debug!("health changed during read, not caching unhealthy list");
        }
        Ok(unhealthy)
    }

    pub async fn summary(&self) -> Result<HealthSummary> {
        let now = Utc::now();
        let mut summary = HealthSummary::default();
        for record in self.get_all_health().await? {
            if record.has_no_data() {
                summary.no_data += 1;
                continue;
            }
            summary.tracked += 1;
            if record.is_healthy(&self.policy) {
                summary.healthy += 1;
            } else {
                summary.unhealthy += 1;
            }
            if record.is_stale(&self.policy, now) {
                summary.stale += 1;
            }
        }
        Ok(summary)
    }

    /// Delete records with no activity inside the retention window.
    pub async fn purge_inactive(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.policy.retention;
        let purged = self.store.purge_inactive(cutoff).await?;
        self.invalidate();
        Ok(purged)
    }

    pub async fn reset(&self, source: ContentSource) -> Result<()> {
        self.store.reset(source).await?;
        self.invalidate();
        Ok(())
    }
}

/// One source's record with its derived flags, as printed by `catsync health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRow {
    #[serde(flatten)]
    pub record: ScraperHealthRecord,
    pub success_rate: f64,
    pub healthy: bool,
    pub stale: bool,
    pub no_data: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub summary: HealthSummary,
    pub sources: Vec<HealthRow>,
}

impl HealthTracker {
    pub async fn report(&self) -> Result<HealthReport> {
        let now = Utc::now();
        let sources = self
            .get_all_health()
            .await?
            .into_iter()
            .map(|record| HealthRow {
                success_rate: record.success_rate(),
                healthy: record.is_healthy(&self.policy),
                stale: record.is_stale(&self.policy, now),
                no_data: record.has_no_data(),
                record,
            })
            .collect();
        Ok(HealthReport {
            summary: self.summary().await?,
            sources,
        })
    }
}

/// `catsync health`: optionally purge or reset, then print every source.
pub async fn run_health(
    config: &crate::config::Config,
    purge: bool,
    reset: Option<ContentSource>,
    json: bool,
) -> Result<()> {
    let store = Arc::new(crate::store::SqliteStore::open(config).await?);
    let tracker = HealthTracker::new(store.clone(), HealthPolicy::from(&config.health));

    if let Some(source) = reset {
        tracker.reset(source).await?;
        if !json {
            println!("reset {}", source);
        }
    }
    if purge {
        let purged = tracker.purge_inactive().await?;
        if !json {
            println!("purged {} inactive record(s)", purged);
        }
    }

    let report = tracker.report().await?;
    store.pool().close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{:<24} {:>7} {:>7} {:>7}  {:<10} LAST ERROR",
        "SOURCE", "OK", "FAILED", "RATE", "STATUS"
    );
    for row in &report.sources {
        let status = if row.no_data {
            "no data"
        } else if !row.healthy {
            "UNHEALTHY"
        } else if row.stale {
            "stale"
        } else {
            "healthy"
        };
        let last_error = match (&row.record.last_error_type, &row.record.last_error_message) {
            (Some(kind), Some(message)) => format!("[{}] {}", kind, message),
            (None, Some(message)) => message.clone(),
            _ => "-".to_string(),
        };
        println!(
            "{:<24} {:>7} {:>7} {:>6.1}%  {:<10} {}",
            row.record.source.as_str(),
            row.record.success_count,
            row.record.failure_count,
            row.success_rate * 100.0,
            status,
            last_error
        );
    }
    let summary = &report.summary;
    println!();
    println!(
        "{} tracked, {} healthy, {} unhealthy, {} stale, {} without data",
        summary.tracked, summary.healthy, summary.unhealthy, summary.stale, summary.no_data
    );
    Ok(())
}
