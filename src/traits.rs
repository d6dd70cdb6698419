//! Source adapter trait and registry.
//!
//! Every content source is driven through [`SourceAdapter`]. The orchestrator
//! only ever sees this trait, so tests can register in-memory adapters and
//! production wiring builds the real ones from config with
//! [`AdapterRegistry::from_config`].
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               AdapterRegistry                │
//! │  ┌────────┐ ┌─────────┐ ┌────────┐ ┌──────┐  │
//! │  │  API   │ │ Sitemap │ │ Scrape │ │ Auth │  │
//! │  └────────┘ └─────────┘ └────────┘ └──────┘  │
//! └──────────────────────┬───────────────────────┘
//!                        ▼
//!          SyncOrchestrator → CatalogStore
//! ```

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cdn::CdnUrlBuilder;
use crate::config::Config;
use crate::connector_api::ApiAdapter;
use crate::connector_auth::AuthenticatedAdapter;
use crate::connector_scrape::{ScrapeAdapter, ScrapeTarget};
use crate::connector_sitemap::SitemapAdapter;
use crate::credentials::{CredentialStore, InMemoryCredentialStore};
use crate::error::FetchError;
use crate::health::HealthTracker;
use crate::http::HttpFetcher;
use crate::models::{CanonicalItem, ContentSource};
use crate::security::SecurityGate;
use crate::session::SessionContext;

/// What one adapter pass produced.
///
/// `errors` holds non-fatal failures (a detail page that timed out, a post
/// type whose sitemap could not be read). Their presence makes the pass
/// partial: items are still upserted but the cursor stays where it was.
#[derive(Debug, Default)]
pub struct Harvest {
    pub items: Vec<CanonicalItem>,
    pub errors: Vec<FetchError>,
    /// Items or cards discarded during normalization.
    pub dropped: usize,
}

impl Harvest {
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn merge(&mut self, other: Harvest) {
        self.items.extend(other.items);
        self.errors.extend(other.errors);
        self.dropped += other.dropped;
    }
}

/// A content source the orchestrator can sync.
///
/// `fetch_candidates` returns `Err` only when the pass produced nothing
/// usable (login refused, listing unreachable). The cutoff is a hint: an
/// adapter may return older items, and the orchestrator filters anyway.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> ContentSource;

    /// One-line description for `catsync sources`.
    fn description(&self) -> &str;

    async fn fetch_candidates(&self, cutoff: Option<DateTime<Utc>>) -> Result<Harvest, FetchError>;
}

/// Adapters keyed by source. At most one adapter per source.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an adapter, replacing any previous one for the same source.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        let source = adapter.source();
        self.adapters.retain(|a| a.source() != source);
        self.adapters.push(adapter);
    }

    pub fn get(&self, source: ContentSource) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.iter().find(|a| a.source() == source).cloned()
    }

    pub fn list(&self) -> &[Arc<dyn SourceAdapter>] {
        &self.adapters
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Build adapters for every configured source.
    ///
    /// Credentials for the authenticated source are seeded from the
    /// environment variables named in its config table.
    pub fn from_config(
        config: &Config,
        gate: Arc<SecurityGate>,
        health: Arc<HealthTracker>,
    ) -> Result<Self> {
        let mut registry = Self::new();
        let fetcher = HttpFetcher::new(&config.http, Arc::clone(&gate), None)?;
        let cdn = CdnUrlBuilder::new(&config.cdn.base_url);

        if let Some(api) = &config.sources.api {
            registry.register(Arc::new(ApiAdapter::new(api.clone(), fetcher.clone())));
        }

        if let Some(sitemap) = &config.sources.sitemap {
            registry.register(Arc::new(SitemapAdapter::new(
                sitemap.clone(),
                fetcher.clone(),
                Arc::clone(&health),
                config.sync.max_detail_pages,
            )));
        }

        if let Some(scraper) = &config.sources.scraper {
            let target = ScrapeTarget {
                base_url: scraper.base_url.clone(),
                categories: scraper.categories.clone(),
                card_selectors: scraper.card_selectors.clone(),
                fetch_episodes: scraper.fetch_episodes,
                video_host: config.cdn.video_host.clone(),
                legacy_hosts: config.cdn.legacy_hosts.clone(),
                max_detail_pages: config.sync.max_detail_pages,
            };
            registry.register(Arc::new(ScrapeAdapter::new(
                ContentSource::ScrapedCatalog,
                target,
                fetcher.clone(),
                cdn.clone(),
            )));
        }

        if let Some(auth) = &config.sources.authenticated {
            let credentials: Arc<dyn CredentialStore> = Arc::new(
                InMemoryCredentialStore::from_env(&auth.email_env, &auth.password_env),
            );
            let session = Arc::new(SessionContext::new(
                auth.clone(),
                &config.http,
                Arc::clone(&gate),
                credentials,
            )?);
            let target = ScrapeTarget {
                base_url: auth.base_url.clone(),
                categories: auth.categories.clone(),
                card_selectors: auth.card_selectors.clone(),
                fetch_episodes: true,
                video_host: config.cdn.video_host.clone(),
                legacy_hosts: config.cdn.legacy_hosts.clone(),
                max_detail_pages: config.sync.max_detail_pages,
            };
            let scrape = ScrapeAdapter::new(
                ContentSource::AuthenticatedCatalog,
                target,
                session.fetcher().clone(),
                cdn,
            );
            registry.register(Arc::new(AuthenticatedAdapter::new(session, scrape)));
        }

        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentKind;

    struct Fixed(ContentSource, &'static str);

    #[async_trait]
    impl SourceAdapter for Fixed {
        fn source(&self) -> ContentSource {
            self.0
        }
        fn description(&self) -> &str {
            self.1
        }
        async fn fetch_candidates(
            &self,
            _cutoff: Option<DateTime<Utc>>,
        ) -> Result<Harvest, FetchError> {
            Ok(Harvest::default())
        }
    }

    #[test]
    fn register_replaces_same_source() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(Fixed(ContentSource::SitemapCatalog, "old")));
        registry.register(Arc::new(Fixed(ContentSource::ScrapedCatalog, "scrape")));
        registry.register(Arc::new(Fixed(ContentSource::SitemapCatalog, "new")));

        assert_eq!(registry.list().len(), 2);
        let sitemap = registry.get(ContentSource::SitemapCatalog).unwrap();
        assert_eq!(sitemap.description(), "new");
        assert!(registry.get(ContentSource::PrimaryCatalog).is_none());
    }

    #[test]
    fn harvest_merge_accumulates() {
        let mut a = Harvest {
            items: vec![CanonicalItem::new(
                ContentSource::ScrapedCatalog,
                ContentKind::Movie,
                "a",
                "A",
                "https://namakade.com/a",
            )],
            errors: Vec::new(),
            dropped: 1,
        };
        a.merge(Harvest {
            items: Vec::new(),
            errors: vec![FetchError::network("HTTP 500")],
            dropped: 2,
        });
        assert_eq!(a.items.len(), 1);
        assert_eq!(a.dropped, 3);
        assert!(a.is_partial());
    }

    #[test]
    fn from_config_builds_configured_sources_only() {
        let mut config = Config::minimal("/tmp/catsync-test.sqlite".into());
        config.security.allowed_domains = vec!["farsiland.com".to_string()];
        config.sources.sitemap = Some(crate::config::SitemapSourceConfig {
            base_url: "https://farsiland.com".to_string(),
            post_types: vec!["movies".to_string()],
        });
        let gate = Arc::new(SecurityGate::new(config.security.allowed_domains.clone()));
        let health = Arc::new(HealthTracker::new(
            Arc::new(crate::store::InMemoryStore::new()),
            Default::default(),
        ));

        let registry = AdapterRegistry::from_config(&config, gate, health).unwrap();
        assert_eq!(registry.list().len(), 1);
        assert!(registry.get(ContentSource::SitemapCatalog).is_some());
    }
}
