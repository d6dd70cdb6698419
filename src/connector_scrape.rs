//! HTML scraping adapter.
//!
//! For sites with no API. A pass walks the configured category pages,
//! parses catalog cards with the selector fallback chain, then visits each
//! card's detail page:
//!
//! ```text
//! category page ──parse_cards──▶ cards ──detail page──▶ metadata + video URL
//!                                                  └──(series)──▶ episode list
//! ```
//!
//! Video URLs found on the page win; otherwise the CDN naming rules supply
//! one. Every media URL passes the security gate before it is stored, and a
//! URL the gate refuses is left out rather than stored.
//!
//! The same adapter serves the authenticated source, driven through the
//! session's cookie-carrying fetcher.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use url::Url;

use crate::cdn::CdnUrlBuilder;
use crate::config::CategoryPage;
use crate::error::{FetchError, ScrapeResult};
use crate::http::HttpFetcher;
use crate::markup::{
    default_card_selectors, extract_metadata, extract_video_url, parse_cards, parse_episode_list,
    CardParse, CardSelectorSet,
};
use crate::models::{CanonicalItem, ContentCard, ContentKind, ContentSource};
use crate::security::SecurityGate;
use crate::traits::{Harvest, SourceAdapter};

/// Where and how one scraped site is crawled.
#[derive(Debug, Clone)]
pub struct ScrapeTarget {
    pub base_url: String,
    pub categories: Vec<CategoryPage>,
    /// Tried before the built-in chain.
    pub card_selectors: Vec<CardSelectorSet>,
    pub fetch_episodes: bool,
    /// Host whose `.mp4` URLs count as playable.
    pub video_host: String,
    /// Retired hosts rewritten onto `video_host`.
    pub legacy_hosts: Vec<String>,
    pub max_detail_pages: usize,
}

/// Fixed inputs for turning a detail page into items.
pub struct DetailContext<'a> {
    pub source: ContentSource,
    pub cdn: &'a CdnUrlBuilder,
    pub gate: &'a SecurityGate,
    pub video_host: &'a str,
    pub legacy_hosts: &'a [String],
    pub with_episodes: bool,
}

impl DetailContext<'_> {
    fn secure(&self, url: String) -> Option<String> {
        let admitted = self.gate.admit(&url);
        if admitted.is_none() {
            warn!(source = %self.source, url = %url, "URL rejected by security gate");
        }
        admitted
    }
}

/// The card with its page URL in gate-approved form, or `None` when the
/// gate refuses the link.
pub fn admit_card(mut card: ContentCard, gate: &SecurityGate) -> Option<ContentCard> {
    card.page_url = gate.admit(&card.page_url)?;
    Some(card)
}

/// Build items from a card alone, before (or instead of) its detail page.
pub fn item_from_card(card: &ContentCard, series: bool, ctx: &DetailContext<'_>) -> CanonicalItem {
    let kind = if series {
        ContentKind::Series
    } else {
        ContentKind::Movie
    };
    let mut item = CanonicalItem::new(ctx.source, kind, &card.slug, &card.title, &card.page_url);
    item.poster_url = card.thumbnail_url.clone().and_then(|u| ctx.secure(u));
    item.genres = card.genre.iter().cloned().collect();
    if series {
        item.poster_url = item
            .poster_url
            .or_else(|| ctx.secure(ctx.cdn.build_series_poster_url(&card.slug)));
    } else {
        item.video_url = ctx.secure(ctx.cdn.build_movie_url(&card.slug));
        item.poster_url = item
            .poster_url
            .or_else(|| ctx.secure(ctx.cdn.build_movie_poster_url(&card.slug)));
    }
    item
}

/// Items described by a fetched detail page: the movie or series itself,
/// plus one item per listed episode for a series.
pub fn items_from_detail(
    card: &ContentCard,
    series: bool,
    html: &str,
    page_url: &str,
    ctx: &DetailContext<'_>,
) -> Vec<CanonicalItem> {
    let base = Url::parse(page_url).ok();
    let mut item = item_from_card(card, series, ctx);
    extract_metadata(html, base.as_ref()).fill(&mut item);
    item.poster_url = item.poster_url.and_then(|u| ctx.secure(u));
    item.backdrop_url = item.backdrop_url.and_then(|u| ctx.secure(u));

    if !series {
        if let Some(found) = extract_video_url(html, ctx.video_host, ctx.legacy_hosts).and_then(|u| ctx.secure(u)) {
            item.video_url = Some(found);
        }
        return vec![item];
    }

    let mut items = Vec::new();
    if ctx.with_episodes {
        match parse_episode_list(html, base.as_ref()) {
            ScrapeResult::Success(episodes) => {
                for ep in episodes {
                    let Some(episode_page) = ctx.secure(ep.page_url) else {
                        continue;
                    };
                    let mut episode = CanonicalItem::new(
                        ctx.source,
                        ContentKind::Episode {
                            series_slug: Some(card.slug.clone()),
                            season: ep.season,
                            episode: ep.episode_number,
                        },
                        &ep.slug,
                        &format!("{} - Episode {}", item.title, ep.episode_number),
                        &episode_page,
                    );
                    episode.video_url =
                        ctx.secure(ctx.cdn.build_episode_url_from_slug(&card.slug, ep.episode_number));
                    episode.poster_url = ep
                        .thumbnail_url
                        .and_then(|u| ctx.secure(u))
                        .or_else(|| {
                            ctx.secure(
                                ctx.cdn
                                    .build_episode_thumbnail_url(&card.slug, ep.episode_number),
                            )
                        });
                    episode.backdrop_url = item.poster_url.clone();
                    episode.genres = item.genres.clone();
                    episode.published_at = item.published_at;
                    episode.modified_at = item.modified_at;
                    items.push(episode);
                }
            }
            ScrapeResult::NoDataFound => debug!(series = %card.slug, "no episodes listed"),
            other => {
                if let Some(msg) = other.error_message() {
                    warn!(series = %card.slug, error = %msg, "episode list unreadable");
                }
            }
        }
    }
    items.insert(0, item);
    items
}

fn is_series(category: &CategoryPage) -> bool {
    category.kind.eq_ignore_ascii_case("series")
}

pub struct ScrapeAdapter {
    source: ContentSource,
    target: ScrapeTarget,
    base: String,
    selectors: Vec<CardSelectorSet>,
    fetcher: HttpFetcher,
    cdn: CdnUrlBuilder,
}

impl ScrapeAdapter {
    pub fn new(
        source: ContentSource,
        target: ScrapeTarget,
        fetcher: HttpFetcher,
        cdn: CdnUrlBuilder,
    ) -> Self {
        let mut selectors = target.card_selectors.clone();
        selectors.extend(default_card_selectors());
        Self {
            source,
            base: target.base_url.trim_end_matches('/').to_string(),
            target,
            selectors,
            fetcher,
            cdn,
        }
    }

    fn page_url(&self, path: &str) -> String {
        if path.starts_with("https://") || path.starts_with("http://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base, path.trim_start_matches('/'))
        }
    }

    fn context(&self) -> DetailContext<'_> {
        DetailContext {
            source: self.source,
            cdn: &self.cdn,
            gate: self.fetcher.gate(),
            video_host: &self.target.video_host,
            legacy_hosts: &self.target.legacy_hosts,
            with_episodes: self.target.fetch_episodes,
        }
    }

    /// Fetch one category page and parse its cards.
    pub async fn scrape_category(&self, category: &CategoryPage) -> ScrapeResult<CardParse> {
        let url = self.page_url(&category.path);
        let page = match self.fetcher.get_ok(&url).await {
            Ok(page) => page,
            Err(err) => return err.into(),
        };
        let base = Url::parse(&page.url).ok();
        let parsed = parse_cards(&page.body, &self.selectors, base.as_ref());
        if let ScrapeResult::Success(parse) = &parsed {
            debug!(
                url = %url,
                cards = parse.cards.len(),
                candidate = parse.candidate_index,
                "category parsed"
            );
        }
        parsed
    }

    /// Fetch a card's detail page and build its items.
    pub async fn scrape_detail(
        &self,
        card: &ContentCard,
        series: bool,
    ) -> Result<Vec<CanonicalItem>, FetchError> {
        let page = self.fetcher.get_ok(&card.page_url).await?;
        Ok(items_from_detail(
            card,
            series,
            &page.body,
            &page.url,
            &self.context(),
        ))
    }

    /// One full pass over every category and its detail pages.
    pub async fn harvest(&self) -> Result<Harvest, FetchError> {
        let mut harvest = Harvest::default();
        let mut seen = HashSet::new();
        let mut listed: Vec<(ContentCard, bool)> = Vec::new();

        for category in &self.target.categories {
            match self.scrape_category(category).await {
                ScrapeResult::Success(parse) => {
                    harvest.dropped += parse.dropped;
                    for card in parse.cards {
                        let Some(card) = admit_card(card, self.fetcher.gate()) else {
                            harvest.dropped += 1;
                            continue;
                        };
                        if seen.insert(card.page_url.clone()) {
                            listed.push((card, is_series(category)));
                        }
                    }
                }
                ScrapeResult::NoDataFound => {
                    debug!(source = %self.source, path = %category.path, "category is empty")
                }
                failure => {
                    if let Err(err) = failure.into_result() {
                        warn!(source = %self.source, path = %category.path, error = %err, "category failed");
                        harvest.errors.push(err);
                    }
                }
            }
        }

        if listed.is_empty() && !harvest.errors.is_empty() {
            return Err(harvest.errors.remove(0));
        }

        let ctx = self.context();
        for (index, (card, series)) in listed.iter().enumerate() {
            if index >= self.target.max_detail_pages {
                harvest.items.push(item_from_card(card, *series, &ctx));
                continue;
            }
            if index > 0 {
                self.fetcher.pause().await;
            }
            match self.scrape_detail(card, *series).await {
                Ok(items) => harvest.items.extend(items),
                Err(err) => {
                    warn!(source = %self.source, url = %card.page_url, error = %err, "detail page failed");
                    harvest.errors.push(err);
                }
            }
        }

        if listed.len() > self.target.max_detail_pages {
            info!(
                source = %self.source,
                cards = listed.len(),
                budget = self.target.max_detail_pages,
                "detail budget exhausted, remaining cards stored without details"
            );
        }

        Ok(harvest)
    }
}

#[async_trait]
impl SourceAdapter for ScrapeAdapter {
    fn source(&self) -> ContentSource {
        self.source
    }

    fn description(&self) -> &str {
        "Scraped category and detail pages"
    }

    async fn fetch_candidates(&self, _cutoff: Option<DateTime<Utc>>) -> Result<Harvest, FetchError> {
        self.harvest().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;
    use std::sync::Arc;

    const CDN: &str = "https://media.negahestan.com/ipnx/media";

    fn gate() -> SecurityGate {
        SecurityGate::new(["namakade.com", "negahestan.com"])
    }

    fn card(slug: &str, series: bool) -> ContentCard {
        let section = if series { "series" } else { "movies" };
        ContentCard {
            title: "Bamdaade Khomaar".to_string(),
            slug: slug.to_string(),
            page_url: format!("https://namakade.com/{}/{}", section, slug),
            thumbnail_url: None,
            genre: Some("Drama".to_string()),
            count: None,
        }
    }

    fn with_ctx<T>(f: impl FnOnce(&DetailContext<'_>) -> T) -> T {
        let cdn = CdnUrlBuilder::new(CDN);
        let gate = gate();
        let ctx = DetailContext {
            source: ContentSource::ScrapedCatalog,
            cdn: &cdn,
            gate: &gate,
            video_host: "media.negahestan.com",
            legacy_hosts: &[],
            with_episodes: true,
        };
        f(&ctx)
    }

    #[test]
    fn movie_page_video_wins_over_cdn_guess() {
        let html = r#"<html><head><meta property="og:description" content="A night in Tehran."></head>
            <body><video src="https://media.negahestan.com/ipnx/media/movies/Shab_Final.mp4"></video></body></html>"#;
        let items = with_ctx(|ctx| {
            items_from_detail(
                &card("shab", false),
                false,
                html,
                "https://namakade.com/movies/shab",
                ctx,
            )
        });
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].video_url.as_deref(),
            Some("https://media.negahestan.com/ipnx/media/movies/Shab_Final.mp4")
        );
        assert_eq!(items[0].description.as_deref(), Some("A night in Tehran."));
        assert_eq!(items[0].genres, vec!["Drama"]);
    }

    #[test]
    fn movie_without_player_falls_back_to_cdn() {
        let items = with_ctx(|ctx| {
            items_from_detail(
                &card("the-last-night", false),
                false,
                "<html><body><h1>The Last Night</h1></body></html>",
                "https://namakade.com/movies/the-last-night",
                ctx,
            )
        });
        assert_eq!(
            items[0].video_url.as_deref(),
            Some("https://media.negahestan.com/ipnx/media/movies/TheLastNight.mp4")
        );
        assert_eq!(
            items[0].poster_url.as_deref(),
            Some("https://media.negahestan.com/ipnx/media/movies/TheLastNight.jpg")
        );
    }

    #[test]
    fn series_page_yields_episode_items() {
        let html = r#"<html><body>
            <ul id="gridMason2">
              <li><a href="/series/bamdaade-khomaar/episodes/bamdaade-khomaar-1"><img src="/thumbs/1.jpg"></a></li>
              <li><a href="/series/bamdaade-khomaar/episodes/bamdaade-khomaar-2"></a></li>
            </ul></body></html>"#;
        let items = with_ctx(|ctx| {
            items_from_detail(
                &card("bamdaade-khomaar", true),
                true,
                html,
                "https://namakade.com/series/bamdaade-khomaar",
                ctx,
            )
        });

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].kind, ContentKind::Series);
        assert_eq!(
            items[0].poster_url.as_deref(),
            Some("https://media.negahestan.com/ipnx/media/series/Bamdaade_Khomaar.jpg")
        );
        assert_eq!(
            items[1].kind,
            ContentKind::Episode {
                series_slug: Some("bamdaade-khomaar".to_string()),
                season: 1,
                episode: 1
            }
        );
        assert_eq!(
            items[1].video_url.as_deref(),
            Some("https://media.negahestan.com/ipnx/media/series/episodes/Bamdaade_Khomaar_01.mp4")
        );
        assert_eq!(
            items[1].poster_url.as_deref(),
            Some("https://namakade.com/thumbs/1.jpg")
        );
        assert_eq!(
            items[2].poster_url.as_deref(),
            Some("https://media.negahestan.com/ipnx/media/series/episodes/Bamdaade_Khomaar_02.jpg")
        );
        assert_ne!(items[1].id, items[2].id);
    }

    #[test]
    fn untrusted_media_is_not_stored() {
        let html = r#"<video src="https://evil.example.com/x.mp4"></video>"#;
        let cdn = CdnUrlBuilder::new("https://cdn.untrusted.net/media");
        let gate = gate();
        let ctx = DetailContext {
            source: ContentSource::ScrapedCatalog,
            cdn: &cdn,
            gate: &gate,
            video_host: "evil.example.com",
            legacy_hosts: &[],
            with_episodes: false,
        };
        let items = items_from_detail(
            &card("film", false),
            false,
            html,
            "https://namakade.com/movies/film",
            &ctx,
        );
        assert!(items[0].video_url.is_none());
        assert!(items[0].poster_url.is_none());
    }

    #[test]
    fn untrusted_card_and_episode_links_are_not_stored() {
        let gate = gate();
        let mut foreign = card("x", true);
        foreign.page_url = "http://evil.example.com/series/x".to_string();
        assert!(admit_card(foreign, &gate).is_none());

        let mut upgraded = card("x", true);
        upgraded.page_url = "http://namakade.com/series/x".to_string();
        assert_eq!(
            admit_card(upgraded, &gate).unwrap().page_url,
            "https://namakade.com/series/x"
        );

        let html = r#"<ul id="gridMason2">
              <li><a href="http://evil.example.com/ep/x-1"></a></li>
              <li><a href="/series/x/episodes/x-2"></a></li>
            </ul>"#;
        let items = with_ctx(|ctx| {
            items_from_detail(&card("x", true), true, html, "https://namakade.com/series/x", ctx)
        });
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[1].source_page_url,
            "https://namakade.com/series/x/episodes/x-2"
        );
        assert!(items
            .iter()
            .all(|item| !item.source_page_url.contains("evil.example.com")));
    }

    #[tokio::test]
    async fn insecure_base_fails_before_any_request() {
        let gate = Arc::new(SecurityGate::new(["namakade.com"]));
        let fetcher = HttpFetcher::new(&HttpConfig::default(), gate, None).unwrap();
        let adapter = ScrapeAdapter::new(
            ContentSource::ScrapedCatalog,
            ScrapeTarget {
                base_url: "http://namakade.com".to_string(),
                categories: vec![CategoryPage {
                    path: "/movies".to_string(),
                    kind: "movie".to_string(),
                }],
                card_selectors: Vec::new(),
                fetch_episodes: false,
                video_host: "media.negahestan.com".to_string(),
                legacy_hosts: Vec::new(),
                max_detail_pages: 5,
            },
            fetcher,
            CdnUrlBuilder::new(CDN),
        );

        let category = adapter
            .scrape_category(&CategoryPage {
                path: "/series".to_string(),
                kind: "series".to_string(),
            })
            .await;
        assert!(matches!(category, ScrapeResult::SecurityError(_)));

        let err = adapter.fetch_candidates(None).await.unwrap_err();
        assert!(matches!(err, FetchError::Security(_)));
    }
}
