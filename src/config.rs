use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::markup::CardSelectorSet;
use crate::models::ContentSource;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub cdn: CdnConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    pub allowed_domains: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_request_delay")]
    pub request_delay_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            request_delay_ms: default_request_delay(),
        }
    }
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string()
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_request_timeout() -> u64 {
    30
}
fn default_request_delay() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_max_concurrent_sources")]
    pub max_concurrent_sources: usize,
    /// Effective timestamp is `modified ?? published` when set; publish date only otherwise.
    #[serde(default = "default_true")]
    pub modified_fallback: bool,
    /// Playback fraction at which an item counts as watched.
    #[serde(default = "default_watched_threshold")]
    pub watched_threshold: f64,
    #[serde(default = "default_max_detail_pages")]
    pub max_detail_pages: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sources: default_max_concurrent_sources(),
            modified_fallback: true,
            watched_threshold: default_watched_threshold(),
            max_detail_pages: default_max_detail_pages(),
        }
    }
}

fn default_max_concurrent_sources() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_watched_threshold() -> f64 {
    0.95
}
fn default_max_detail_pages() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: f64,
    #[serde(default = "default_stale_after_hours")]
    pub stale_after_hours: i64,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            healthy_threshold: default_healthy_threshold(),
            stale_after_hours: default_stale_after_hours(),
            retention_days: default_retention_days(),
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_healthy_threshold() -> f64 {
    0.70
}
fn default_stale_after_hours() -> i64 {
    24
}
fn default_retention_days() -> i64 {
    30
}
fn default_cache_ttl() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CdnConfig {
    #[serde(default = "default_cdn_base")]
    pub base_url: String,
    /// Host serving direct `.mp4` files.
    #[serde(default = "default_video_host")]
    pub video_host: String,
    /// Host serving `.m3u8` live playlists.
    #[serde(default = "default_live_host")]
    pub live_host: String,
    /// Retired media hosts; URLs on them are rewritten onto `video_host`.
    #[serde(default = "default_legacy_hosts")]
    pub legacy_hosts: Vec<String>,
}

impl Default for CdnConfig {
    fn default() -> Self {
        Self {
            base_url: default_cdn_base(),
            video_host: default_video_host(),
            live_host: default_live_host(),
            legacy_hosts: default_legacy_hosts(),
        }
    }
}

fn default_cdn_base() -> String {
    "https://media.negahestan.com/ipnx/media".to_string()
}
fn default_video_host() -> String {
    "media.negahestan.com".to_string()
}
fn default_live_host() -> String {
    "live.negahestan.com".to_string()
}
fn default_legacy_hosts() -> Vec<String> {
    vec![
        "media.iranproud2.net".to_string(),
        "media.iranproud.net".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    pub api: Option<ApiSourceConfig>,
    pub sitemap: Option<SitemapSourceConfig>,
    pub scraper: Option<ScraperSourceConfig>,
    pub authenticated: Option<AuthenticatedSourceConfig>,
}

/// WordPress REST catalog (`{base}/wp-json/wp/v2/...`).
#[derive(Debug, Deserialize, Clone)]
pub struct ApiSourceConfig {
    pub base_url: String,
    #[serde(default = "default_post_types")]
    pub post_types: Vec<String>,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_post_types() -> Vec<String> {
    vec![
        "movies".to_string(),
        "tvshows".to_string(),
        "episodes".to_string(),
    ]
}
fn default_per_page() -> u32 {
    100
}
fn default_max_pages() -> u32 {
    50
}

/// Sitemap-only site (`{base}/wp-sitemap-posts-{type}-1.xml`).
#[derive(Debug, Deserialize, Clone)]
pub struct SitemapSourceConfig {
    pub base_url: String,
    #[serde(default = "default_post_types")]
    pub post_types: Vec<String>,
}

/// A listing page and the kind of content its cards link to.
#[derive(Debug, Deserialize, Clone)]
pub struct CategoryPage {
    pub path: String,
    #[serde(default = "default_category_kind")]
    pub kind: String,
}

fn default_category_kind() -> String {
    "movie".to_string()
}

/// Site without an API; listing and detail pages are scraped.
#[derive(Debug, Deserialize, Clone)]
pub struct ScraperSourceConfig {
    pub base_url: String,
    #[serde(default)]
    pub categories: Vec<CategoryPage>,
    /// Selector sets tried before the built-in fallback chain.
    #[serde(default)]
    pub card_selectors: Vec<CardSelectorSet>,
    #[serde(default = "default_true")]
    pub fetch_episodes: bool,
}

/// Scraped site behind a login form.
#[derive(Debug, Deserialize, Clone)]
pub struct AuthenticatedSourceConfig {
    pub base_url: String,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    /// Where a successful login lands.
    #[serde(default = "default_post_login_path")]
    pub post_login_path: String,
    /// A page only visible to logged-in users, used for session checks.
    #[serde(default = "default_protected_path")]
    pub protected_path: String,
    /// Case-insensitive body markers present only when logged in.
    #[serde(default = "default_auth_markers")]
    pub authenticated_markers: Vec<String>,
    #[serde(default)]
    pub categories: Vec<CategoryPage>,
    #[serde(default)]
    pub card_selectors: Vec<CardSelectorSet>,
    /// Environment variables seeded into the credential store at startup.
    #[serde(default = "default_email_env")]
    pub email_env: String,
    #[serde(default = "default_password_env")]
    pub password_env: String,
}

fn default_login_path() -> String {
    "/login".to_string()
}
fn default_post_login_path() -> String {
    "/".to_string()
}
fn default_protected_path() -> String {
    "/account".to_string()
}
fn default_auth_markers() -> Vec<String> {
    vec![
        "logout".to_string(),
        "log out".to_string(),
        "sign out".to_string(),
    ]
}
fn default_email_env() -> String {
    "CATSYNC_AUTH_EMAIL".to_string()
}
fn default_password_env() -> String {
    "CATSYNC_AUTH_PASSWORD".to_string()
}

impl SourcesConfig {
    /// Sources with a configuration table, in sync order.
    pub fn configured(&self) -> Vec<ContentSource> {
        let mut out = Vec::new();
        if self.api.is_some() {
            out.push(ContentSource::PrimaryCatalog);
        }
        if self.sitemap.is_some() {
            out.push(ContentSource::SitemapCatalog);
        }
        if self.scraper.is_some() {
            out.push(ContentSource::ScrapedCatalog);
        }
        if self.authenticated.is_some() {
            out.push(ContentSource::AuthenticatedCatalog);
        }
        out
    }

    /// Configured base URL for a source.
    pub fn base_url(&self, source: ContentSource) -> Option<&str> {
        match source {
            ContentSource::PrimaryCatalog => self.api.as_ref().map(|c| c.base_url.as_str()),
            ContentSource::SitemapCatalog => self.sitemap.as_ref().map(|c| c.base_url.as_str()),
            ContentSource::ScrapedCatalog => self.scraper.as_ref().map(|c| c.base_url.as_str()),
            ContentSource::AuthenticatedCatalog => {
                self.authenticated.as_ref().map(|c| c.base_url.as_str())
            }
            ContentSource::MediaUrlResolution => None,
        }
    }
}

impl Config {
    /// A config with no sources, used by commands that only need the database.
    pub fn minimal(db_path: PathBuf) -> Self {
        Self {
            db: DbConfig { path: db_path },
            security: SecurityConfig {
                allowed_domains: Vec::new(),
            },
            http: HttpConfig::default(),
            sync: SyncConfig::default(),
            health: HealthConfig::default(),
            cdn: CdnConfig::default(),
            sources: SourcesConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.security.allowed_domains.is_empty() {
        anyhow::bail!("security.allowed_domains must list at least one domain");
    }

    if config.http.connect_timeout_secs == 0 || config.http.request_timeout_secs == 0 {
        anyhow::bail!("http timeouts must be > 0");
    }

    if !(0.0..=1.0).contains(&config.health.healthy_threshold) {
        anyhow::bail!("health.healthy_threshold must be in [0.0, 1.0]");
    }

    if !(0.0..=1.0).contains(&config.sync.watched_threshold) {
        anyhow::bail!("sync.watched_threshold must be in [0.0, 1.0]");
    }

    if config.sync.max_concurrent_sources == 0 {
        anyhow::bail!("sync.max_concurrent_sources must be >= 1");
    }

    if let Some(api) = &config.sources.api {
        if api.per_page == 0 || api.per_page > 100 {
            anyhow::bail!("sources.api.per_page must be in 1..=100");
        }
    }

    for source in config.sources.configured() {
        let base = config.sources.base_url(source).unwrap_or_default();
        if url::Url::parse(base).is_err() {
            anyhow::bail!("sources.{}: base_url '{}' is not a valid URL", source, base);
        }
    }

    for category in config
        .sources
        .scraper
        .iter()
        .flat_map(|s| s.categories.iter())
        .chain(
            config
                .sources
                .authenticated
                .iter()
                .flat_map(|s| s.categories.iter()),
        )
    {
        match category.kind.as_str() {
            "movie" | "series" => {}
            other => anyhow::bail!(
                "Unknown category kind: '{}' for '{}'. Must be movie or series.",
                other,
                category.path
            ),
        }
    }

    let overrides = [
        ("scraper", config.sources.scraper.as_ref().map(|s| &s.card_selectors)),
        (
            "authenticated",
            config.sources.authenticated.as_ref().map(|s| &s.card_selectors),
        ),
    ];
    for (table, sets) in overrides {
        for (index, set) in sets.into_iter().flatten().enumerate() {
            if let Err(msg) = set.validate() {
                anyhow::bail!(
                    "sources.{}.card_selectors[{}] ('{}'): {}",
                    table,
                    index,
                    set.name,
                    msg
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[db]
path = "./data/catalog.sqlite"

[security]
allowed_domains = ["farsiland.com", "namakade.com"]

[sources.api]
base_url = "https://farsiland.com"

[sources.scraper]
base_url = "https://namakade.com"
categories = [{ path = "/best-serial", kind = "series" }]
"#;

    #[test]
    fn parses_with_defaults() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.http.request_timeout_secs, 30);
        assert!((config.health.healthy_threshold - 0.70).abs() < f64::EPSILON);
        assert!((config.sync.watched_threshold - 0.95).abs() < f64::EPSILON);
        assert!(config.sync.modified_fallback);
        assert_eq!(
            config.sources.configured(),
            vec![ContentSource::PrimaryCatalog, ContentSource::ScrapedCatalog]
        );
        assert_eq!(config.sources.api.unwrap().post_types.len(), 3);
    }

    #[test]
    fn rejects_empty_allow_list() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.security.allowed_domains.clear();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_unknown_category_kind() {
        let text = SAMPLE.replace("kind = \"series\"", "kind = \"podcast\"");
        let config: Config = toml::from_str(&text).unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("podcast"));
    }

    #[test]
    fn example_config_is_valid() {
        let config: Config =
            toml::from_str(include_str!("../config/catsync.example.toml")).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.sources.configured().len(), 3);
        assert_eq!(config.sync.max_detail_pages, 100);
        assert_eq!(
            config.cdn.legacy_hosts,
            vec!["media.iranproud2.net", "media.iranproud.net"]
        );
    }

    #[test]
    fn invalid_card_selector_override_is_rejected() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        if let Some(scraper) = config.sources.scraper.as_mut() {
            scraper
                .card_selectors
                .push(CardSelectorSet::new("broken", "div[data-card"));
        }
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("sources.scraper.card_selectors[0]"), "got: {}", err);
        assert!(err.contains("broken"));

        if let Some(scraper) = config.sources.scraper.as_mut() {
            scraper.card_selectors[0].item = "div.card".to_string();
        }
        validate_config(&config).unwrap();
    }
}
