//! Sitemap adapter.
//!
//! For sites that publish WordPress core sitemaps but no usable API. Each
//! post type has one sitemap at `{base}/wp-sitemap-posts-{type}-1.xml`:
//!
//! ```xml
//! <urlset>
//!   <url><loc>https://site/movies/the-film/</loc><lastmod>2024-06-01T10:00:00+00:00</lastmod></url>
//!   <url><loc>https://site/movies/other/</loc></url>
//! </urlset>
//! ```
//!
//! Entries newer than the cursor are followed to their detail pages, whose
//! markup supplies title, poster and the rest. `lastmod` becomes the item's
//! modified timestamp.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SitemapSourceConfig;
use crate::error::FetchError;
use crate::health::HealthTracker;
use crate::http::HttpFetcher;
use crate::markup::{extract_metadata, kind_for_post_type, parse_timestamp};
use crate::models::{
    slug_from_url, title_from_slug, CanonicalItem, ContentKind, ContentSource, SitemapEntry,
};
use crate::security::SecurityGate;
use crate::traits::{Harvest, SourceAdapter};

/// URL of the first sitemap page for a post type.
pub fn sitemap_url(base: &str, post_type: &str) -> String {
    format!(
        "{}/wp-sitemap-posts-{}-1.xml",
        base.trim_end_matches('/'),
        post_type
    )
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    Loc,
    LastMod,
}

fn store_text(
    field: Option<Field>,
    text: String,
    loc: &mut Option<String>,
    lastmod: &mut Option<String>,
) {
    match field {
        Some(Field::Loc) => *loc = Some(text),
        Some(Field::LastMod) => *lastmod = Some(text),
        None => {}
    }
}

/// Parse a `<urlset>` in one forward pass.
///
/// `loc`/`lastmod` text is collected while inside a `<url>`; on `</url>` an
/// entry is emitted if a location was seen and both fields are reset, so a
/// missing `lastmod` never leaks into the next entry.
pub fn parse_sitemap(xml: &str) -> Result<Vec<SitemapEntry>, FetchError> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut in_url = false;
    let mut field: Option<Field> = None;
    let mut loc: Option<String> = None;
    let mut lastmod: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"url" => {
                    in_url = true;
                    loc = None;
                    lastmod = None;
                }
                b"loc" if in_url => field = Some(Field::Loc),
                b"lastmod" if in_url => field = Some(Field::LastMod),
                _ => {}
            },
            Ok(Event::Text(te)) if field.is_some() => {
                let text = te
                    .unescape()
                    .map_err(|e| FetchError::parse(format!("sitemap: {}", e)))?;
                store_text(field, text.trim().to_string(), &mut loc, &mut lastmod);
            }
            Ok(Event::CData(cdata)) if field.is_some() => {
                let text = String::from_utf8_lossy(&cdata.into_inner()).trim().to_string();
                store_text(field, text, &mut loc, &mut lastmod);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"loc" | b"lastmod" => field = None,
                b"url" => {
                    if let Some(location) = loc.take().filter(|l| !l.is_empty()) {
                        entries.push(SitemapEntry {
                            location,
                            last_modified: lastmod.take().and_then(|v| parse_timestamp(&v)),
                        });
                    }
                    lastmod = None;
                    in_url = false;
                    field = None;
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(FetchError::parse(format!(
                    "malformed sitemap at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    Ok(entries)
}

/// Most recently modified first; entries without `lastmod` go last.
pub fn sort_recent(mut entries: Vec<SitemapEntry>, limit: usize) -> Vec<SitemapEntry> {
    entries.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
    entries.truncate(limit);
    entries
}

/// Keep entries whose location the gate admits, rewritten to that form.
/// Returns the kept entries and how many were refused.
pub fn admit_entries(entries: Vec<SitemapEntry>, gate: &SecurityGate) -> (Vec<SitemapEntry>, usize) {
    let total = entries.len();
    let kept: Vec<SitemapEntry> = entries
        .into_iter()
        .filter_map(|mut entry| {
            entry.location = gate.admit(&entry.location)?;
            Some(entry)
        })
        .collect();
    let refused = total - kept.len();
    (kept, refused)
}

pub struct SitemapAdapter {
    config: SitemapSourceConfig,
    base: String,
    fetcher: HttpFetcher,
    health: Arc<HealthTracker>,
    max_detail_pages: usize,
}

impl SitemapAdapter {
    pub fn new(
        config: SitemapSourceConfig,
        fetcher: HttpFetcher,
        health: Arc<HealthTracker>,
        max_detail_pages: usize,
    ) -> Self {
        Self {
            base: config.base_url.trim_end_matches('/').to_string(),
            config,
            fetcher,
            health,
            max_detail_pages,
        }
    }

    /// Fetch and parse one sitemap.
    ///
    /// Never fails: a rejected URL, transport error, non-2xx status or
    /// malformed document yields an empty list and a health failure.
    pub async fn fetch_sitemap(&self, url: &str) -> Vec<SitemapEntry> {
        match self.try_fetch_sitemap(url).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(source = %ContentSource::SitemapCatalog, url, error = %err, "sitemap fetch failed");
                if let Err(e) = self
                    .health
                    .record_error(ContentSource::SitemapCatalog, &err)
                    .await
                {
                    warn!(error = %e, "failed to record sitemap health");
                }
                Vec::new()
            }
        }
    }

    /// The `limit` most recently modified entries of a sitemap.
    pub async fn get_recent(&self, url: &str, limit: usize) -> Vec<SitemapEntry> {
        sort_recent(self.fetch_sitemap(url).await, limit)
    }

    async fn try_fetch_sitemap(&self, url: &str) -> Result<Vec<SitemapEntry>, FetchError> {
        let page = self.fetcher.get_ok(url).await?;
        let entries = parse_sitemap(&page.body)?;
        debug!(url, entries = entries.len(), "sitemap parsed");
        Ok(entries)
    }

    async fn fetch_detail(
        &self,
        entry: &SitemapEntry,
        post_type: &str,
        slug: &str,
    ) -> Result<CanonicalItem, FetchError> {
        let page = self.fetcher.get_ok(&entry.location).await?;
        let base = Url::parse(&page.url).ok();
        let metadata = extract_metadata(&page.body, base.as_ref());

        let mut item = self.bare_item(entry, post_type, slug);
        item.title = String::new();
        metadata.fill(&mut item);
        if item.title.is_empty() {
            item.title = title_from_slug(slug);
        }
        Ok(item)
    }

    /// An item carrying only what the sitemap itself says.
    fn bare_item(&self, entry: &SitemapEntry, post_type: &str, slug: &str) -> CanonicalItem {
        let mut item = CanonicalItem::new(
            ContentSource::SitemapCatalog,
            kind_for_post_type(post_type, slug),
            slug,
            &title_from_slug(slug),
            &entry.location,
        );
        item.modified_at = entry.last_modified;
        item
    }
}

#[async_trait]
impl SourceAdapter for SitemapAdapter {
    fn source(&self) -> ContentSource {
        ContentSource::SitemapCatalog
    }

    fn description(&self) -> &str {
        "WordPress sitemaps with scraped detail pages"
    }

    async fn fetch_candidates(&self, cutoff: Option<DateTime<Utc>>) -> Result<Harvest, FetchError> {
        let mut harvest = Harvest::default();
        let mut pending: Vec<(&str, SitemapEntry)> = Vec::new();

        for post_type in &self.config.post_types {
            let url = sitemap_url(&self.base, post_type);
            match self.try_fetch_sitemap(&url).await {
                Ok(entries) => {
                    let total = entries.len();
                    let (entries, refused) = admit_entries(entries, self.fetcher.gate());
                    if refused > 0 {
                        warn!(post_type = %post_type, refused, "sitemap entries rejected by security gate");
                        harvest.dropped += refused;
                    }
                    pending.extend(
                        entries
                            .into_iter()
                            .filter(|e| match (cutoff, e.last_modified) {
                                (Some(cutoff), Some(at)) => at > cutoff,
                                _ => true,
                            })
                            .map(|e| (post_type.as_str(), e)),
                    );
                    debug!(post_type = %post_type, total, "sitemap entries");
                }
                Err(err) => {
                    warn!(post_type = %post_type, error = %err, "sitemap unavailable");
                    harvest.errors.push(err);
                }
            }
        }

        if pending.is_empty() && !harvest.errors.is_empty() {
            return Err(harvest.errors.remove(0));
        }

        // Newest first so the detail budget covers the freshest entries.
        pending.sort_by(|a, b| b.1.last_modified.cmp(&a.1.last_modified));

        for (index, (post_type, entry)) in pending.iter().enumerate() {
            let Some(slug) = slug_from_url(&entry.location) else {
                harvest.dropped += 1;
                continue;
            };

            if index >= self.max_detail_pages {
                harvest.items.push(self.bare_item(entry, post_type, &slug));
                continue;
            }
            if index > 0 {
                self.fetcher.pause().await;
            }
            match self.fetch_detail(entry, post_type, &slug).await {
                Ok(item) => harvest.items.push(item),
                Err(err) => {
                    warn!(url = %entry.location, error = %err, "detail page failed");
                    harvest.errors.push(err);
                }
            }
        }

        if pending.len() > self.max_detail_pages {
            info!(
                pending = pending.len(),
                budget = self.max_detail_pages,
                "detail budget exhausted, remaining entries stored from sitemap only"
            );
        }

        Ok(harvest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;
    use crate::health::{ErrorType, HealthPolicy};
    use crate::store::InMemoryStore;
    use chrono::TimeZone;

    const THREE_ENTRIES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url>
    <loc>https://farsiland.com/movies/older/</loc>
    <lastmod>2024-01-10T08:00:00+00:00</lastmod>
  </url>
  <url>
    <loc>https://farsiland.com/movies/undated/</loc>
  </url>
  <url>
    <loc>https://farsiland.com/movies/newest/</loc>
    <lastmod>2024-06-01T12:30:00+00:00</lastmod>
  </url>
</urlset>"#;

    #[test]
    fn builds_sitemap_url() {
        assert_eq!(
            sitemap_url("https://farsiland.com/", "tvshows"),
            "https://farsiland.com/wp-sitemap-posts-tvshows-1.xml"
        );
    }

    #[test]
    fn missing_lastmod_does_not_leak_between_entries() {
        let entries = parse_sitemap(THREE_ENTRIES).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0].last_modified,
            Some(Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap())
        );
        assert_eq!(entries[1].location, "https://farsiland.com/movies/undated/");
        assert_eq!(entries[1].last_modified, None);
        assert!(entries[2].last_modified.is_some());
    }

    #[test]
    fn recent_excludes_undated_entry_when_limited() {
        let recent = sort_recent(parse_sitemap(THREE_ENTRIES).unwrap(), 2);
        let locations: Vec<&str> = recent.iter().map(|e| e.location.as_str()).collect();
        assert_eq!(
            locations,
            vec![
                "https://farsiland.com/movies/newest/",
                "https://farsiland.com/movies/older/"
            ]
        );

        let all = sort_recent(parse_sitemap(THREE_ENTRIES).unwrap(), 10);
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].last_modified, None);
    }

    #[test]
    fn entries_outside_the_gate_are_refused() {
        let gate = SecurityGate::new(["farsiland.com"]);
        let xml = r#"<urlset>
            <url><loc>http://farsiland.com/movies/upgraded/</loc></url>
            <url><loc>https://mirror.example.net/movies/copied/</loc></url>
            <url><loc>http://evil.example.com/movies/x/</loc></url>
          </urlset>"#;
        let (kept, refused) = admit_entries(parse_sitemap(xml).unwrap(), &gate);
        assert_eq!(refused, 2);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].location, "https://farsiland.com/movies/upgraded/");
    }

    #[test]
    fn url_without_loc_is_skipped() {
        let xml = "<urlset><url><lastmod>2024-01-01</lastmod></url><url><loc>https://a.com/x</loc></url></urlset>";
        let entries = parse_sitemap(xml).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].last_modified, None);
    }

    #[test]
    fn cdata_locations_are_read() {
        let xml = "<urlset><url><loc><![CDATA[https://a.com/movies/x/]]></loc></url></urlset>";
        assert_eq!(parse_sitemap(xml).unwrap()[0].location, "https://a.com/movies/x/");
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        let err = parse_sitemap("<urlset><url><loc>x</lo></url>").unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }

    #[test]
    fn empty_urlset_yields_no_entries() {
        assert!(parse_sitemap("<urlset></urlset>").unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_sitemap_is_empty_and_recorded() {
        let store = Arc::new(InMemoryStore::new());
        let health = Arc::new(HealthTracker::new(store, HealthPolicy::default()));
        let gate = Arc::new(SecurityGate::new(["farsiland.com"]));
        let fetcher = HttpFetcher::new(&HttpConfig::default(), gate, None).unwrap();
        let adapter = SitemapAdapter::new(
            SitemapSourceConfig {
                base_url: "http://farsiland.com".to_string(),
                post_types: vec!["movies".to_string()],
            },
            fetcher,
            Arc::clone(&health),
            10,
        );

        let entries = adapter
            .get_recent("http://farsiland.com/wp-sitemap-posts-movies-1.xml", 2)
            .await;
        assert!(entries.is_empty());

        let record = health.get_health(ContentSource::SitemapCatalog).await.unwrap();
        assert_eq!(record.failure_count, 1);
        assert_eq!(record.last_error_type, Some(ErrorType::Security));

        let err = adapter.fetch_candidates(None).await.unwrap_err();
        assert!(matches!(err, FetchError::Security(_)));
    }
}
