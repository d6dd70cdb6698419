//! Core data models used throughout catalog-sync.
//!
//! These types represent the source identities, canonical content items, and
//! transient parse products that flow through the acquisition pipeline:
//!
//! ```text
//! adapter ──▶ SitemapEntry / ContentCard / EpisodeReference ──▶ CanonicalItem ──▶ store
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Identity of an origin site (or of the media-resolution step).
///
/// Used as the key for sync cursors and health records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSource {
    /// WordPress-style REST catalog.
    PrimaryCatalog,
    /// Site that only publishes sitemaps; details come from page markup.
    SitemapCatalog,
    /// Site with no API at all; category and detail pages are scraped.
    ScrapedCatalog,
    /// Scraped site that requires a logged-in session.
    AuthenticatedCatalog,
    /// Page URL → playable media URL resolution.
    MediaUrlResolution,
}

impl ContentSource {
    pub const ALL: [ContentSource; 5] = [
        ContentSource::PrimaryCatalog,
        ContentSource::SitemapCatalog,
        ContentSource::ScrapedCatalog,
        ContentSource::AuthenticatedCatalog,
        ContentSource::MediaUrlResolution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentSource::PrimaryCatalog => "primary_catalog",
            ContentSource::SitemapCatalog => "sitemap_catalog",
            ContentSource::ScrapedCatalog => "scraped_catalog",
            ContentSource::AuthenticatedCatalog => "authenticated_catalog",
            ContentSource::MediaUrlResolution => "media_url_resolution",
        }
    }
}

impl fmt::Display for ContentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "primary_catalog" | "api" | "primary" => Ok(ContentSource::PrimaryCatalog),
            "sitemap_catalog" | "sitemap" => Ok(ContentSource::SitemapCatalog),
            "scraped_catalog" | "scraper" | "scraped" => Ok(ContentSource::ScrapedCatalog),
            "authenticated_catalog" | "authenticated" | "auth" => {
                Ok(ContentSource::AuthenticatedCatalog)
            }
            "media_url_resolution" | "media" => Ok(ContentSource::MediaUrlResolution),
            other => anyhow::bail!(
                "Unknown source: '{}'. Available: api, sitemap, scraper, authenticated",
                other
            ),
        }
    }
}

/// One `<url>` element of a sitemap. Transient; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitemapEntry {
    pub location: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Movie / series / episode discriminator of a [`CanonicalItem`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentKind {
    Movie,
    Series,
    Episode {
        series_slug: Option<String>,
        season: u32,
        episode: u32,
    },
}

impl ContentKind {
    pub fn label(&self) -> &'static str {
        match self {
            ContentKind::Movie => "movie",
            ContentKind::Series => "series",
            ContentKind::Episode { .. } => "episode",
        }
    }
}

/// Normalized content record stored locally, independent of source format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalItem {
    pub id: i64,
    pub source: ContentSource,
    pub kind: ContentKind,
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    pub poster_url: Option<String>,
    pub backdrop_url: Option<String>,
    pub source_page_url: String,
    pub year: Option<i32>,
    pub rating: Option<f32>,
    pub genres: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub video_url: Option<String>,
}

impl CanonicalItem {
    /// Create an item with only the identifying fields set.
    pub fn new(
        source: ContentSource,
        kind: ContentKind,
        slug: &str,
        title: &str,
        source_page_url: &str,
    ) -> Self {
        Self {
            id: stable_id(&kind, slug),
            source,
            kind,
            slug: slug.to_string(),
            title: title.to_string(),
            description: None,
            poster_url: None,
            backdrop_url: None,
            source_page_url: source_page_url.to_string(),
            year: None,
            rating: None,
            genres: Vec::new(),
            published_at: None,
            modified_at: None,
            video_url: None,
        }
    }

    /// The timestamp used for delta-sync comparisons.
    ///
    /// `modified ?? published` when `modified_fallback` is on, otherwise the
    /// publish date alone.
    pub fn effective_modified_at(&self, modified_fallback: bool) -> Option<DateTime<Utc>> {
        if modified_fallback {
            self.modified_at.or(self.published_at)
        } else {
            self.published_at
        }
    }

    /// SHA-256 over every stored field; equal hashes mean an upsert is a no-op.
    pub fn dedup_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.to_le_bytes());
        hasher.update(self.source.as_str().as_bytes());
        hasher.update(serde_json::to_vec(&self.kind).unwrap_or_default());
        for field in [
            Some(self.slug.as_str()),
            Some(self.title.as_str()),
            self.description.as_deref(),
            self.poster_url.as_deref(),
            self.backdrop_url.as_deref(),
            Some(self.source_page_url.as_str()),
            self.video_url.as_deref(),
        ] {
            hasher.update(field.unwrap_or("\u{0}").as_bytes());
            hasher.update([0x1f]);
        }
        hasher.update(self.year.unwrap_or_default().to_le_bytes());
        hasher.update(self.rating.unwrap_or_default().to_le_bytes());
        hasher.update(self.genres.join("\u{1f}").as_bytes());
        hasher.update(self.published_at.map(|t| t.timestamp()).unwrap_or(0).to_le_bytes());
        hasher.update(self.modified_at.map(|t| t.timestamp()).unwrap_or(0).to_le_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Deterministic numeric id derived from the kind and slug.
///
/// Re-scraping the same page always yields the same id, so upserts replace
/// rather than duplicate.
pub fn stable_id(kind: &ContentKind, slug: &str) -> i64 {
    let key = match kind {
        ContentKind::Episode {
            series_slug: Some(series),
            season,
            episode,
        } => format!("episode:{}:{}x{}", series, season, episode),
        other => format!("{}:{}", other.label(), slug),
    };
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) % 100_000_000) as i64
}

/// An episode link parsed from a series page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeReference {
    pub season: u32,
    pub episode_number: u32,
    pub slug: String,
    /// Absolute URL of the episode page.
    pub page_url: String,
    pub thumbnail_url: Option<String>,
}

/// A catalog card parsed from a category/listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentCard {
    pub title: String,
    pub slug: String,
    pub page_url: String,
    pub thumbnail_url: Option<String>,
    pub genre: Option<String>,
    pub count: Option<u32>,
}

/// Extract the trailing, non-empty path segment of a URL (its slug).
pub fn slug_from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let path = match without_query.find("://") {
        Some(idx) => {
            let rest = &without_query[idx + 3..];
            rest.find('/').map(|p| &rest[p..]).unwrap_or("")
        }
        None => without_query,
    };
    path.split('/')
        .rev()
        .find(|segment| !segment.is_empty())
        .map(|s| s.to_string())
}

/// Readable title for an item known only by its slug: `the-last-night` → `The Last Night`.
pub fn title_from_slug(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|t| !t.is_empty())
        .map(|token| {
            let mut chars = token.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn source_round_trips_through_labels() {
        for source in ContentSource::ALL {
            assert_eq!(source.as_str().parse::<ContentSource>().unwrap(), source);
        }
        assert_eq!(
            "sitemap".parse::<ContentSource>().unwrap(),
            ContentSource::SitemapCatalog
        );
        assert!("nope".parse::<ContentSource>().is_err());
    }

    #[test]
    fn effective_timestamp_prefers_modified() {
        let mut item = CanonicalItem::new(
            ContentSource::PrimaryCatalog,
            ContentKind::Series,
            "show",
            "Show",
            "https://example.com/tvshows/show/",
        );
        let published = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let modified = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        item.published_at = Some(published);
        assert_eq!(item.effective_modified_at(true), Some(published));

        item.modified_at = Some(modified);
        assert_eq!(item.effective_modified_at(true), Some(modified));
        assert_eq!(item.effective_modified_at(false), Some(published));
    }

    #[test]
    fn stable_id_is_deterministic_and_bounded() {
        let a = stable_id(&ContentKind::Movie, "breaking-bad");
        let b = stable_id(&ContentKind::Movie, "breaking-bad");
        assert_eq!(a, b);
        assert!((0..100_000_000).contains(&a));
        assert_ne!(a, stable_id(&ContentKind::Series, "breaking-bad"));

        let episode = |season, episode| ContentKind::Episode {
            series_slug: Some("breaking-bad".to_string()),
            season,
            episode,
        };
        assert_eq!(
            stable_id(&episode(1, 2), "breaking-bad-1x2"),
            stable_id(&episode(1, 2), "other-slug-for-same-episode")
        );
        assert_ne!(
            stable_id(&episode(1, 2), "x"),
            stable_id(&episode(2, 1), "x")
        );
    }

    #[test]
    fn dedup_hash_tracks_content_changes() {
        let item = CanonicalItem::new(
            ContentSource::ScrapedCatalog,
            ContentKind::Movie,
            "film",
            "Film",
            "https://example.com/film",
        );
        let mut changed = item.clone();
        assert_eq!(item.dedup_hash(), changed.dedup_hash());
        changed.title = "Film (Remastered)".to_string();
        assert_ne!(item.dedup_hash(), changed.dedup_hash());
    }

    #[test]
    fn slug_is_trailing_segment() {
        assert_eq!(
            slug_from_url("https://site.com/series/bamdaade-khomaar/").as_deref(),
            Some("bamdaade-khomaar")
        );
        assert_eq!(
            slug_from_url("/movies/the-film?ref=home").as_deref(),
            Some("the-film")
        );
        assert_eq!(slug_from_url("https://site.com/"), None);
    }

    #[test]
    fn title_from_slug_capitalizes_tokens() {
        assert_eq!(title_from_slug("the-last-night"), "The Last Night");
        assert_eq!(title_from_slug("khane-be-doosh_2"), "Khane Be Doosh 2");
    }
}
