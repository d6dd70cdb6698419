//! Markup parsers.
//!
//! Pure functions over an HTML string: catalog cards, episode lists, media
//! URLs, page metadata, login-form tokens and player sources. Nothing here
//! performs I/O, and no parsed document outlives the call that created it,
//! so the parsers can run on any worker thread.
//!
//! Two kinds of fallback chains are used:
//!
//! - **Selector chains** for cards: each [`CardSelectorSet`] is compiled and
//!   tried in order; the first whose item selector matches anything wins.
//! - **Strategy chains** for media URLs: an ordered list of extraction
//!   functions, short-circuiting on the first hit.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::error::ScrapeResult;
use crate::models::{slug_from_url, CanonicalItem, ContentCard, ContentKind, EpisodeReference};

static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());
static IMG: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img").unwrap());
static VIDEO: LazyLock<Selector> = LazyLock::new(|| Selector::parse("video").unwrap());
static SOURCE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("source").unwrap());
static SCRIPT: LazyLock<Selector> = LazyLock::new(|| Selector::parse("script").unwrap());
static ANY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("*").unwrap());
static IFRAME: LazyLock<Selector> = LazyLock::new(|| Selector::parse("iframe[src]").unwrap());
static H1: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").unwrap());
static TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").unwrap());
static META: LazyLock<Selector> = LazyLock::new(|| Selector::parse("meta[content]").unwrap());
static SEASON_CONTAINER: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.se-c").unwrap());
static SEASON_TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("span.se-t").unwrap());
static EPISODE_ITEM: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("ul.episodios > li").unwrap());
static NUMERANDO: LazyLock<Selector> = LazyLock::new(|| Selector::parse(".numerando").unwrap());
static EPISODE_GRID_ITEM: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("ul#gridMason2 > li").unwrap());
static GENRE_LINK: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a[href*="/genres/"], a[href*="/genre/"], .sgeneros a"#).unwrap());
static RATING: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"[itemprop="ratingValue"], .dt_rating_vgs, span.rating, .imdb-rating"#)
        .unwrap()
});
static DATE_TEXT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".extra .date, span.date, .year, .release-year").unwrap());
static POSTER_IMG: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".poster img, img.poster, .cover img").unwrap());
static DESCRIPTION: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".wp-content p, .description, #info .wp-content").unwrap());
static CSRF_INPUT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"input[name="_token"]"#).unwrap());
static CSRF_META: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[name="csrf-token"]"#).unwrap());
static WATCH_FORM: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"form[id^="watch-"]"#).unwrap());
static NONCE_INPUT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"input[name="watch_episode_nonce"]"#).unwrap());
static REFERER_INPUT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"input[name="_wp_http_referer"]"#).unwrap());
static FORM_ERROR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(".alert-danger, .alert-error, .invalid-feedback, .error, .errors li, .help-block")
        .unwrap()
});

static YEAR_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(19\d{2}|20\d{2})\b").unwrap());
static DIGITS_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());
static SLUG_X_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?)-(\d{1,3})x(\d{1,4})$").unwrap());
static SLUG_PAIR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?)-(\d{1,3})-(\d{1,4})$").unwrap());
static WATCH_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^watch-(\d+)$").unwrap());
static SOURCE_PARAM_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"source=([^&'"\s<>]+)"#).unwrap());

// ============ Cards ============

/// One candidate in the card selector fallback chain.
///
/// Only `item` is required; field selectors are evaluated relative to each
/// matched item element.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CardSelectorSet {
    #[serde(default)]
    pub name: String,
    pub item: String,
    #[serde(default = "default_link_selector")]
    pub link: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default = "default_thumbnail_selector")]
    pub thumbnail: String,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub count: Option<String>,
}

fn default_link_selector() -> String {
    "a[href]".to_string()
}

fn default_thumbnail_selector() -> String {
    "img".to_string()
}

impl CardSelectorSet {
    pub fn new(name: &str, item: &str) -> Self {
        Self {
            name: name.to_string(),
            item: item.to_string(),
            link: default_link_selector(),
            title: None,
            thumbnail: default_thumbnail_selector(),
            genre: None,
            count: None,
        }
    }

    pub fn with_title(mut self, selector: &str) -> Self {
        self.title = Some(selector.to_string());
        self
    }

    pub fn with_genre(mut self, selector: &str) -> Self {
        self.genre = Some(selector.to_string());
        self
    }

    pub fn with_count(mut self, selector: &str) -> Self {
        self.count = Some(selector.to_string());
        self
    }

    /// Check every selector in the set compiles.
    pub fn validate(&self) -> Result<(), String> {
        self.compile().map(|_| ())
    }

    fn compile(&self) -> Result<CompiledCardSet, String> {
        Ok(CompiledCardSet {
            item: parse_selector(&self.item)?,
            link: parse_selector(&self.link)?,
            title: self.title.as_deref().map(parse_selector).transpose()?,
            thumbnail: parse_selector(&self.thumbnail)?,
            genre: self.genre.as_deref().map(parse_selector).transpose()?,
            count: self.count.as_deref().map(parse_selector).transpose()?,
        })
    }
}

struct CompiledCardSet {
    item: Selector,
    link: Selector,
    title: Option<Selector>,
    thumbnail: Selector,
    genre: Option<Selector>,
    count: Option<Selector>,
}

/// Built-in chain, newest template first.
pub fn default_card_selectors() -> Vec<CardSelectorSet> {
    vec![
        CardSelectorSet::new(
            "item",
            "article.item, div.item, li.item, div.video-item, article.post",
        )
        .with_title("h2, h3, .title")
        .with_genre(".genre, .category")
        .with_count(".count, .episodes"),
        CardSelectorSet::new("poster", ".poster, .movie-item, .series-item")
            .with_title("h2, h3, .title"),
        CardSelectorSet::new("grid", "ul#gridMason2 > li, .grid-item").with_title(".title, span"),
    ]
}

/// Cards extracted by the winning selector set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardParse {
    pub cards: Vec<ContentCard>,
    /// Position of the winning set in the candidate list.
    pub candidate_index: usize,
    /// Matched elements skipped because a required field was missing.
    pub dropped: usize,
}

/// Parse catalog cards using the first candidate set that matches.
///
/// Returns `NoDataFound` for a document with no links at all (an empty
/// listing page) and `ParseError` when links exist but no candidate matches.
pub fn parse_cards(
    html: &str,
    candidates: &[CardSelectorSet],
    base: Option<&Url>,
) -> ScrapeResult<CardParse> {
    let document = Html::parse_document(html);

    for (index, set) in candidates.iter().enumerate() {
        let compiled = match set.compile() {
            Ok(compiled) => compiled,
            Err(msg) => {
                warn!(candidate = %set.name, error = %msg, "skipping invalid card selector set");
                continue;
            }
        };

        let items: Vec<ElementRef> = document.select(&compiled.item).collect();
        if items.is_empty() {
            debug!(candidate = %set.name, "card selector matched nothing");
            continue;
        }

        let mut cards = Vec::with_capacity(items.len());
        let mut dropped = 0;
        for item in items {
            match extract_card(item, &compiled, base) {
                Ok(card) => cards.push(card),
                Err(reason) => {
                    dropped += 1;
                    warn!(candidate = %set.name, reason, "dropping card");
                }
            }
        }

        return ScrapeResult::Success(CardParse {
            cards,
            candidate_index: index,
            dropped,
        });
    }

    if document.select(&ANCHOR).next().is_none() {
        ScrapeResult::NoDataFound
    } else {
        ScrapeResult::ParseError(format!(
            "none of {} card selector sets matched",
            candidates.len()
        ))
    }
}

fn extract_card(
    item: ElementRef<'_>,
    selectors: &CompiledCardSet,
    base: Option<&Url>,
) -> Result<ContentCard, &'static str> {
    let link = if item.value().name() == "a" && item.value().attr("href").is_some() {
        item
    } else {
        item.select(&selectors.link).next().ok_or("missing link")?
    };
    let href = link.value().attr("href").ok_or("missing href")?;
    let page_url = resolve_url(base, href).ok_or("unresolvable link")?;
    let slug = slug_from_url(&page_url).ok_or("missing slug")?;

    let thumbnail_el = item.select(&selectors.thumbnail).next();
    let title = link
        .value()
        .attr("title")
        .map(collapse_whitespace)
        .filter(|t| !t.is_empty())
        .or_else(|| {
            selectors
                .title
                .as_ref()
                .and_then(|sel| item.select(sel).next())
                .map(element_text)
                .filter(|t| !t.is_empty())
        })
        .or_else(|| {
            thumbnail_el
                .and_then(|img| img.value().attr("alt"))
                .map(collapse_whitespace)
                .filter(|t| !t.is_empty())
        })
        .or_else(|| Some(element_text(link)).filter(|t| !t.is_empty()))
        .ok_or("missing title")?;

    let thumbnail_url = thumbnail_el
        .and_then(image_src)
        .and_then(|src| resolve_url(base, src));

    let genre = selectors
        .genre
        .as_ref()
        .and_then(|sel| item.select(sel).next())
        .map(element_text)
        .filter(|t| !t.is_empty());

    let count = selectors
        .count
        .as_ref()
        .and_then(|sel| item.select(sel).next())
        .and_then(|el| first_number(&element_text(el)));

    Ok(ContentCard {
        title,
        slug,
        page_url,
        thumbnail_url,
        genre,
        count,
    })
}

// ============ Episodes ============

/// Parse episode-number text.
///
/// `"5"` is season 1 episode 5; `"2-3"` (spaces allowed) is season 2
/// episode 3. Tokens that are not integers count as 1.
pub fn parse_episode_number(text: &str) -> (u32, u32) {
    let mut tokens = text.split('-').map(str::trim).filter(|t| !t.is_empty());
    let number = |token: Option<&str>| token.and_then(|t| t.parse::<u32>().ok()).unwrap_or(1);
    let first = tokens.next();
    match tokens.next() {
        None => (1, number(first)),
        Some(second) => (number(first), number(Some(second))),
    }
}

/// Split an episode slug such as `shahrzad-2x3` or `shahrzad-2-3` into
/// `(series_slug, season, episode)`.
pub fn episode_from_slug(slug: &str) -> Option<(String, u32, u32)> {
    let slug = slug.trim_matches('/');
    let caps = SLUG_X_REGEX
        .captures(slug)
        .or_else(|| SLUG_PAIR_REGEX.captures(slug))?;
    let season = caps.get(2)?.as_str().parse().ok()?;
    let episode = caps.get(3)?.as_str().parse().ok()?;
    Some((caps.get(1)?.as_str().to_string(), season, episode))
}

/// Parse the episode list of a series page.
///
/// Tries season containers (`div.se-c` with `ul.episodios`) first, then the
/// masonry grid (`ul#gridMason2`) where episodes are numbered by position.
pub fn parse_episode_list(html: &str, base: Option<&Url>) -> ScrapeResult<Vec<EpisodeReference>> {
    let document = Html::parse_document(html);
    let mut episodes = Vec::new();

    let containers: Vec<ElementRef> = document.select(&SEASON_CONTAINER).collect();
    if containers.is_empty() {
        collect_listed_episodes(document.root_element(), 1, base, &mut episodes);
    } else {
        for container in containers {
            let season = container
                .select(&SEASON_TITLE)
                .next()
                .and_then(|el| first_number(&element_text(el)))
                .unwrap_or(1);
            collect_listed_episodes(container, season, base, &mut episodes);
        }
    }

    if episodes.is_empty() {
        for (position, item) in document.select(&EPISODE_GRID_ITEM).enumerate() {
            let Some(link) = item.select(&ANCHOR).next() else {
                continue;
            };
            let Some(page_url) = link
                .value()
                .attr("href")
                .and_then(|href| resolve_url(base, href))
            else {
                continue;
            };
            let Some(slug) = slug_from_url(&page_url) else {
                continue;
            };
            let (season, episode_number) = match episode_from_slug(&slug) {
                Some((_, season, episode)) => (season, episode),
                None => (1, position as u32 + 1),
            };
            episodes.push(EpisodeReference {
                season,
                episode_number,
                slug,
                page_url,
                thumbnail_url: item
                    .select(&IMG)
                    .next()
                    .and_then(image_src)
                    .and_then(|src| resolve_url(base, src)),
            });
        }
    }

    let mut seen = std::collections::HashSet::new();
    episodes.retain(|ep| seen.insert((ep.season, ep.episode_number)));

    if episodes.is_empty() {
        ScrapeResult::NoDataFound
    } else {
        ScrapeResult::Success(episodes)
    }
}

fn collect_listed_episodes(
    scope: ElementRef<'_>,
    default_season: u32,
    base: Option<&Url>,
    out: &mut Vec<EpisodeReference>,
) {
    // Positional numbers restart in every season container.
    let first = out.len();
    for item in scope.select(&EPISODE_ITEM) {
        let Some(link) = item.select(&ANCHOR).next() else {
            continue;
        };
        let Some(page_url) = link.value().attr("href").and_then(|h| resolve_url(base, h)) else {
            continue;
        };
        let Some(slug) = slug_from_url(&page_url) else {
            continue;
        };

        let (season, episode_number) = match item.select(&NUMERANDO).next() {
            Some(el) => {
                let text = element_text(el);
                if text.contains('-') {
                    parse_episode_number(&text)
                } else {
                    (default_season, parse_episode_number(&text).1)
                }
            }
            None => match episode_from_slug(&slug) {
                Some((_, season, episode)) => (season, episode),
                None => (default_season, (out.len() - first) as u32 + 1),
            },
        };

        out.push(EpisodeReference {
            season,
            episode_number,
            slug,
            page_url,
            thumbnail_url: item
                .select(&IMG)
                .next()
                .and_then(image_src)
                .and_then(|src| resolve_url(base, src)),
        });
    }
}

/// Canonical kind for a WordPress post type (`movies`, `tvshows`, `episodes`).
pub fn kind_for_post_type(post_type: &str, slug: &str) -> ContentKind {
    match post_type {
        "tvshows" | "series" => ContentKind::Series,
        "episodes" => match episode_from_slug(slug) {
            Some((series, season, episode)) => ContentKind::Episode {
                series_slug: Some(series),
                season,
                episode,
            },
            None => {
                let (season, episode) = parse_episode_number(slug);
                ContentKind::Episode {
                    series_slug: None,
                    season,
                    episode,
                }
            }
        },
        _ => ContentKind::Movie,
    }
}

// ============ Media URLs ============

/// Host and extension a media strategy is looking for.
#[derive(Debug, Clone, Copy)]
struct MediaTarget<'a> {
    host: &'a str,
    extension: &'a str,
    /// Retired hosts whose URLs still count and are moved onto `host`.
    legacy_hosts: &'a [String],
}

impl<'a> MediaTarget<'a> {
    fn hosts(self) -> impl Iterator<Item = &'a str> {
        std::iter::once(self.host).chain(self.legacy_hosts.iter().map(String::as_str))
    }
}

type MediaStrategy = fn(&Html, MediaTarget<'_>) -> Option<String>;

const MEDIA_STRATEGIES: [MediaStrategy; 3] = [
    media_from_video_element,
    media_from_inline_scripts,
    media_from_source_attributes,
];

/// Find the direct `.mp4` URL on a movie or episode page.
///
/// URLs on one of `legacy_hosts` are rewritten onto `cdn_host`. `None`
/// means no strategy matched; callers treat that as no data.
pub fn extract_video_url(html: &str, cdn_host: &str, legacy_hosts: &[String]) -> Option<String> {
    extract_media_url(
        html,
        MediaTarget {
            host: cdn_host,
            extension: ".mp4",
            legacy_hosts,
        },
    )
}

/// Find the `.m3u8` playlist URL on a live-channel page.
pub fn extract_live_stream_url(html: &str, live_host: &str) -> Option<String> {
    extract_media_url(
        html,
        MediaTarget {
            host: live_host,
            extension: ".m3u8",
            legacy_hosts: &[],
        },
    )
}

fn extract_media_url(html: &str, target: MediaTarget<'_>) -> Option<String> {
    let document = Html::parse_document(html);
    MEDIA_STRATEGIES
        .iter()
        .find_map(|strategy| strategy(&document, target))
        .map(|url| rewrite_legacy_host(&url, target.legacy_hosts, target.host))
}

/// Move a URL on one of `legacy_hosts` onto `host`; other URLs are returned as is.
pub fn rewrite_legacy_host(url: &str, legacy_hosts: &[String], host: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    let on_legacy = parsed
        .host_str()
        .is_some_and(|h| legacy_hosts.iter().any(|l| l.eq_ignore_ascii_case(h)));
    if on_legacy && parsed.set_host(Some(host)).is_ok() {
        return parsed.to_string();
    }
    url.to_string()
}

fn media_from_video_element(document: &Html, target: MediaTarget<'_>) -> Option<String> {
    document.select(&VIDEO).find_map(|video| {
        video
            .value()
            .attr("src")
            .into_iter()
            .chain(video.select(&SOURCE).filter_map(|s| s.value().attr("src")))
            .map(str::trim)
            .find(|src| is_absolute(src) && path_has_extension(src, target.extension))
            .map(absolute_scheme)
    })
}

fn media_from_inline_scripts(document: &Html, target: MediaTarget<'_>) -> Option<String> {
    let hosts = target.hosts().map(regex::escape).collect::<Vec<_>>().join("|");
    let pattern = format!(
        r#"https://(?:{})/[^\s"'<>\\]+?{}"#,
        hosts,
        regex::escape(target.extension)
    );
    let regex = Regex::new(&pattern).ok()?;
    document.select(&SCRIPT).find_map(|script| {
        let body = script.text().collect::<String>().replace("\\/", "/");
        regex.find(&body).map(|m| m.as_str().to_string())
    })
}

fn media_from_source_attributes(document: &Html, target: MediaTarget<'_>) -> Option<String> {
    const ATTRS: [&str; 6] = ["src", "data-src", "data-url", "href", "content", "file"];
    document.select(&ANY).find_map(|el| {
        ATTRS
            .iter()
            .filter_map(|name| el.value().attr(name))
            .map(str::trim)
            .find(|value| is_absolute(value) && target.hosts().any(|host| value.contains(host)))
            .map(absolute_scheme)
    })
}

fn path_has_extension(url: &str, extension: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.to_ascii_lowercase().ends_with(extension)
}

/// `http(s)://` or protocol-relative. Relative paths cannot be handed to
/// the gate and are skipped so later strategies get a chance.
fn is_absolute(url: &str) -> bool {
    url.starts_with("//")
        || url.split_once("://").is_some_and(|(scheme, _)| {
            scheme.eq_ignore_ascii_case("https") || scheme.eq_ignore_ascii_case("http")
        })
}

fn absolute_scheme(url: &str) -> String {
    match url.strip_prefix("//") {
        Some(rest) => format!("https://{}", rest),
        None => url.to_string(),
    }
}

// ============ Page metadata ============

/// Metadata scraped from a detail page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub poster_url: Option<String>,
    pub backdrop_url: Option<String>,
    pub year: Option<i32>,
    pub rating: Option<f32>,
    pub genres: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl PageMetadata {
    /// Fill fields the item does not have yet. Existing values win.
    pub fn fill(self, item: &mut CanonicalItem) {
        if item.title.trim().is_empty() {
            if let Some(title) = self.title {
                item.title = title;
            }
        }
        item.description = item.description.take().or(self.description);
        item.poster_url = item.poster_url.take().or(self.poster_url);
        item.backdrop_url = item.backdrop_url.take().or(self.backdrop_url);
        item.year = item.year.or(self.year);
        item.rating = item.rating.or(self.rating);
        if item.genres.is_empty() {
            item.genres = self.genres;
        }
        item.published_at = item.published_at.or(self.published_at);
        item.modified_at = item.modified_at.or(self.modified_at);
    }
}

/// Extract metadata from Open Graph tags, falling back to page markup.
pub fn extract_metadata(html: &str, base: Option<&Url>) -> PageMetadata {
    let document = Html::parse_document(html);

    let meta = |keys: &[&str]| -> Option<String> {
        document.select(&META).find_map(|el| {
            let key = el
                .value()
                .attr("property")
                .or_else(|| el.value().attr("name"))?;
            keys.contains(&key)
                .then(|| el.value().attr("content"))
                .flatten()
                .map(collapse_whitespace)
                .filter(|v| !v.is_empty())
        })
    };

    let title = meta(&["og:title", "twitter:title"])
        .or_else(|| document.select(&H1).next().map(element_text))
        .or_else(|| document.select(&TITLE).next().map(element_text))
        .filter(|t| !t.is_empty());

    let description = meta(&["og:description", "description"]).or_else(|| {
        document
            .select(&DESCRIPTION)
            .map(element_text)
            .find(|t| !t.is_empty())
    });

    let poster_url = document
        .select(&POSTER_IMG)
        .next()
        .and_then(image_src)
        .map(str::to_string)
        .or_else(|| meta(&["og:image"]))
        .and_then(|src| resolve_url(base, &src));

    let backdrop_url = meta(&["og:image", "twitter:image"])
        .and_then(|src| resolve_url(base, &src))
        .filter(|url| Some(url) != poster_url.as_ref());

    let published_at = meta(&["article:published_time"]).and_then(|v| parse_timestamp(&v));
    let modified_at =
        meta(&["article:modified_time", "og:updated_time"]).and_then(|v| parse_timestamp(&v));

    let year = document
        .select(&DATE_TEXT)
        .find_map(|el| {
            YEAR_REGEX
                .captures(&element_text(el))
                .and_then(|c| c[1].parse().ok())
        })
        .or_else(|| published_at.map(|t| t.year()))
        .filter(|y| *y > 0);

    let rating = document
        .select(&RATING)
        .find_map(|el| element_text(el).replace(',', ".").parse::<f32>().ok())
        .filter(|r| r.is_finite() && *r >= 0.0);

    let mut genres: Vec<String> = Vec::new();
    for genre in document.select(&GENRE_LINK).map(element_text) {
        if !genre.is_empty() && !genres.contains(&genre) {
            genres.push(genre);
        }
    }

    PageMetadata {
        title,
        description,
        poster_url,
        backdrop_url,
        year,
        rating,
        genres,
        published_at,
        modified_at,
    }
}

/// Parse RFC 3339 / ISO-8601 timestamps, with or without an offset.
///
/// Offset-less values (`2024-01-05T10:00:00`, as in WordPress `*_gmt`
/// fields) are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S"))
        .map(|naive| naive.and_utc())
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        })
}

// ============ Forms ============

/// The CSRF token of a login form (`_token` field or `csrf-token` meta).
pub fn extract_csrf_token(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    document
        .select(&CSRF_INPUT)
        .find_map(|el| el.value().attr("value"))
        .or_else(|| {
            document
                .select(&CSRF_META)
                .find_map(|el| el.value().attr("content"))
        })
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Visible error messages of a rejected form submission.
pub fn extract_form_errors(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    document
        .select(&FORM_ERROR)
        .map(element_text)
        .filter(|t| !t.is_empty())
        .collect()
}

/// Hidden `watch-<post id>` form that unlocks the player page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerForm {
    pub post_id: String,
    pub nonce: String,
    pub referer: String,
}

pub fn extract_player_form(html: &str) -> Option<PlayerForm> {
    let document = Html::parse_document(html);
    document.select(&WATCH_FORM).find_map(|form| {
        let id = form.value().attr("id")?;
        let post_id = WATCH_ID_REGEX.captures(id)?.get(1)?.as_str().to_string();
        let nonce = form
            .select(&NONCE_INPUT)
            .next()?
            .value()
            .attr("value")?
            .to_string();
        let referer = form
            .select(&REFERER_INPUT)
            .next()
            .and_then(|el| el.value().attr("value"))
            .unwrap_or_default()
            .to_string();
        Some(PlayerForm {
            post_id,
            nonce,
            referer,
        })
    })
}

/// Media URLs carried in `source=` parameters of a player page.
///
/// Iframe `src` attributes are read first; then the raw markup is scanned
/// for encoded `source=` values pointing at `.mp4` or `.m3u8` files.
/// Results are URL-decoded and de-duplicated in discovery order.
pub fn extract_player_sources(html: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut push = |url: String| {
        if !found.contains(&url) {
            found.push(url);
        }
    };

    {
        let document = Html::parse_document(html);
        for iframe in document.select(&IFRAME) {
            let Some(src) = iframe.value().attr("src") else {
                continue;
            };
            if !src.contains("source=") {
                continue;
            }
            let query = src.split_once('?').map(|(_, q)| q).unwrap_or(src);
            if let Some(value) = url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "source")
                .map(|(_, value)| value.into_owned())
            {
                push(value);
            }
        }
    }

    for caps in SOURCE_PARAM_REGEX.captures_iter(html) {
        let raw = format!("source={}", &caps[1]);
        let Some((_, value)) = url::form_urlencoded::parse(raw.as_bytes()).next() else {
            continue;
        };
        let lower = value.to_ascii_lowercase();
        if lower.starts_with("http") && (lower.contains(".mp4") || lower.contains(".m3u8")) {
            push(value.into_owned());
        }
    }

    found
}

/// Quality label inferred from a media URL.
///
/// Only the path is read, split into tokens on non-alphanumerics, so a host
/// such as `hdcdn.example` says nothing about quality.
pub fn detect_quality(url: &str) -> &'static str {
    const LABELS: [(&[&str], &str); 4] = [
        (&["1080", "1080p", "fhd"], "1080p"),
        (&["720", "720p", "hd"], "720p"),
        (&["480", "480p", "sd"], "480p"),
        (&["360", "360p"], "360p"),
    ];
    let path = Url::parse(url)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_else(|_| url.to_ascii_lowercase());
    let tokens: Vec<&str> = path
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    LABELS
        .iter()
        .find(|(names, _)| tokens.iter().any(|t| names.contains(t)))
        .map(|(_, label)| *label)
        .unwrap_or("HD")
}

/// Host serving a media URL, used as its CDN label.
pub fn cdn_label(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

// ============ Text helpers ============

/// Strip tags from an HTML fragment and decode entities.
pub fn strip_html(fragment: &str) -> String {
    let parsed = Html::parse_fragment(fragment);
    collapse_whitespace(&parsed.root_element().text().collect::<String>())
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<Vec<_>>().join(" "))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn first_number(text: &str) -> Option<u32> {
    DIGITS_REGEX.find(text).and_then(|m| m.as_str().parse().ok())
}

fn image_src<'a>(img: ElementRef<'a>) -> Option<&'a str> {
    let attrs = img.value();
    attrs
        .attr("src")
        .filter(|s| !s.trim().is_empty() && !s.starts_with("data:"))
        .or_else(|| attrs.attr("data-src"))
        .or_else(|| attrs.attr("data-lazy-src"))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Resolve `href` against `base`; without a base only absolute URLs resolve.
pub fn resolve_url(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    match base {
        Some(base) => base.join(href).ok().map(String::from),
        None => Url::parse(&absolute_scheme(href)).ok().map(String::from),
    }
}

fn parse_selector(selector: &str) -> Result<Selector, String> {
    Selector::parse(selector).map_err(|e| format!("invalid selector '{}': {:?}", selector, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CDN_HOST: &str = "media.negahestan.com";

    #[test]
    fn episode_number_parsing() {
        assert_eq!(parse_episode_number("2 - 3"), (2, 3));
        assert_eq!(parse_episode_number("2-3"), (2, 3));
        assert_eq!(parse_episode_number("5"), (1, 5));
        assert_eq!(parse_episode_number(" 12 "), (1, 12));
        assert_eq!(parse_episode_number("x - 4"), (1, 4));
        assert_eq!(parse_episode_number("special"), (1, 1));
    }

    #[test]
    fn episode_slug_parsing() {
        assert_eq!(
            episode_from_slug("shahrzad-2x3"),
            Some(("shahrzad".to_string(), 2, 3))
        );
        assert_eq!(
            episode_from_slug("the-show-1-10/"),
            Some(("the-show".to_string(), 1, 10))
        );
        assert_eq!(episode_from_slug("a-film"), None);
    }

    #[test]
    fn second_candidate_wins_and_third_is_never_compiled() {
        let html = r#"
            <html><body>
              <div class="poster"><a href="/series/bamdaade-khomaar/" title="Bamdaade Khomaar">
                <img src="/img/bk.jpg"></a></div>
              <div class="poster"><a href="/series/shahrzad/"><img src="/img/s.jpg" alt="Shahrzad"></a></div>
            </body></html>"#;
        let candidates = vec![
            CardSelectorSet::new("legacy", "article.show-card"),
            CardSelectorSet::new("current", "div.poster"),
            CardSelectorSet::new("broken", "div[[["),
        ];
        let base = Url::parse("https://namakade.com/").unwrap();
        let parsed = parse_cards(html, &candidates, Some(&base)).ok().unwrap();
        assert_eq!(parsed.candidate_index, 1);
        assert_eq!(parsed.dropped, 0);
        assert_eq!(parsed.cards.len(), 2);
        assert_eq!(parsed.cards[0].slug, "bamdaade-khomaar");
        assert_eq!(parsed.cards[0].title, "Bamdaade Khomaar");
        assert_eq!(
            parsed.cards[0].thumbnail_url.as_deref(),
            Some("https://namakade.com/img/bk.jpg")
        );
        assert_eq!(parsed.cards[1].title, "Shahrzad");
    }

    #[test]
    fn invalid_selector_set_is_skipped_not_fatal() {
        let html = r#"<div class="poster"><a href="https://s.com/movies/one/"><img alt="One"></a></div>"#;
        let candidates = vec![
            CardSelectorSet::new("typo", "div[[["),
            CardSelectorSet::new("current", "div.poster"),
        ];
        let parsed = parse_cards(html, &candidates, None).ok().unwrap();
        assert_eq!(parsed.candidate_index, 1);
        assert_eq!(parsed.cards.len(), 1);

        let only_broken = vec![CardSelectorSet::new("broken", "div[[[")];
        assert!(matches!(
            parse_cards(html, &only_broken, None),
            ScrapeResult::ParseError(_)
        ));
    }

    #[test]
    fn a_card_missing_its_link_is_dropped_not_fatal() {
        let html = r#"
            <article class="item"><a href="https://s.com/movies/one/"><h3>One</h3></a></article>
            <article class="item"><h3>No link</h3></article>"#;
        let parsed = parse_cards(html, &default_card_selectors(), None)
            .ok()
            .unwrap();
        assert_eq!(parsed.candidate_index, 0);
        assert_eq!(parsed.cards.len(), 1);
        assert_eq!(parsed.dropped, 1);
        assert_eq!(parsed.cards[0].title, "One");
    }

    #[test]
    fn empty_listing_is_no_data_but_unknown_markup_is_parse_error() {
        let selectors = default_card_selectors();
        assert_eq!(
            parse_cards("<html><body><p>Nothing here</p></body></html>", &selectors, None),
            ScrapeResult::NoDataFound
        );
        assert!(matches!(
            parse_cards(
                r#"<section class="new-layout"><a href="https://s.com/m/x">x</a></section>"#,
                &selectors,
                None
            ),
            ScrapeResult::ParseError(_)
        ));
    }

    #[test]
    fn episode_list_from_season_containers() {
        let html = r#"
          <div class="se-c"><span class="se-t">Season 2</span>
            <ul class="episodios">
              <li><img src="https://s.com/e1.jpg"><div class="numerando">2 - 1</div>
                  <a href="https://s.com/episode/show-2x1/">Ep 1</a></li>
              <li><div class="numerando">2 - 2</div><a href="https://s.com/episode/show-2x2/">Ep 2</a></li>
            </ul>
          </div>"#;
        let episodes = parse_episode_list(html, None).ok().unwrap();
        assert_eq!(episodes.len(), 2);
        assert_eq!((episodes[0].season, episodes[0].episode_number), (2, 1));
        assert_eq!(episodes[0].slug, "show-2x1");
        assert_eq!(
            episodes[0].thumbnail_url.as_deref(),
            Some("https://s.com/e1.jpg")
        );
        assert_eq!((episodes[1].season, episodes[1].episode_number), (2, 2));
    }

    #[test]
    fn positional_numbering_restarts_per_season() {
        let html = r#"
          <div class="se-c"><span class="se-t">Season 1</span>
            <ul class="episodios">
              <li><a href="https://s.com/episode/pilot/">Pilot</a></li>
              <li><a href="https://s.com/episode/homecoming/">Homecoming</a></li>
            </ul>
          </div>
          <div class="se-c"><span class="se-t">Season 2</span>
            <ul class="episodios">
              <li><a href="https://s.com/episode/return/">Return</a></li>
            </ul>
          </div>"#;
        let episodes = parse_episode_list(html, None).ok().unwrap();
        let numbers: Vec<(u32, u32)> = episodes
            .iter()
            .map(|ep| (ep.season, ep.episode_number))
            .collect();
        assert_eq!(numbers, vec![(1, 1), (1, 2), (2, 1)]);
    }

    #[test]
    fn episode_list_from_grid_uses_position() {
        let html = r#"
          <ul id="gridMason2">
            <li><a href="/series/bamdaade-khomaar/episode-a"><img src="/a.jpg"></a></li>
            <li><a href="/series/bamdaade-khomaar/episode-b"><img src="/b.jpg"></a></li>
          </ul>"#;
        let base = Url::parse("https://namakade.com/").unwrap();
        let episodes = parse_episode_list(html, Some(&base)).ok().unwrap();
        assert_eq!(episodes[1].episode_number, 2);
        assert_eq!(episodes[1].season, 1);
        assert_eq!(
            parse_episode_list("<p>none</p>", None),
            ScrapeResult::NoDataFound
        );
    }

    #[test]
    fn video_url_strategy_chain() {
        let from_video = r#"<video id="videoTag"><source src="https://media.negahestan.com/ipnx/media/movies/Film.mp4" type="video/mp4"></video>"#;
        assert_eq!(
            extract_video_url(from_video, CDN_HOST, &[]).as_deref(),
            Some("https://media.negahestan.com/ipnx/media/movies/Film.mp4")
        );

        let from_script = r#"<video src="/trailer.webm"></video><script>
            var seriesepisode_respose = {"video_url":[{"android":"https:\/\/media.negahestan.com\/ipnx\/media\/series\/episodes\/Show_03.mp4"}]};
            </script>"#;
        assert_eq!(
            extract_video_url(from_script, CDN_HOST, &[]).as_deref(),
            Some("https://media.negahestan.com/ipnx/media/series/episodes/Show_03.mp4")
        );

        let from_attr = r#"<div data-src="//media.negahestan.com/ipnx/media/stream?id=9"></div>"#;
        assert_eq!(
            extract_video_url(from_attr, CDN_HOST, &[]).as_deref(),
            Some("https://media.negahestan.com/ipnx/media/stream?id=9")
        );

        assert_eq!(extract_video_url("<p>nothing</p>", CDN_HOST, &[]), None);
    }

    #[test]
    fn relative_video_source_falls_through_to_scripts() {
        let html = r#"<video src="/trailer.mp4"></video><script>
            var src = "https://media.negahestan.com/ipnx/media/movies/Film.mp4";
            </script>"#;
        assert_eq!(
            extract_video_url(html, CDN_HOST, &[]).as_deref(),
            Some("https://media.negahestan.com/ipnx/media/movies/Film.mp4")
        );
    }

    #[test]
    fn legacy_media_hosts_are_moved_to_the_cdn() {
        let legacy = vec![
            "media.iranproud2.net".to_string(),
            "media.iranproud.net".to_string(),
        ];
        let from_video =
            r#"<video><source src="https://media.iranproud2.net/ipnx/media/movies/Film.mp4"></video>"#;
        assert_eq!(
            extract_video_url(from_video, CDN_HOST, &legacy).as_deref(),
            Some("https://media.negahestan.com/ipnx/media/movies/Film.mp4")
        );

        let from_script = r#"<script>var u = "https://media.iranproud.net/ipnx/media/series/episodes/Show_01.mp4";</script>"#;
        assert_eq!(
            extract_video_url(from_script, CDN_HOST, &legacy).as_deref(),
            Some("https://media.negahestan.com/ipnx/media/series/episodes/Show_01.mp4")
        );
        assert_eq!(extract_video_url(from_script, CDN_HOST, &[]), None);

        assert_eq!(
            rewrite_legacy_host("https://other.net/a.mp4", &legacy, CDN_HOST),
            "https://other.net/a.mp4"
        );
    }

    #[test]
    fn live_stream_url_uses_its_own_host_and_extension() {
        let html = r#"<script>player.setup({file: "https://live.negahestan.com/hls/ch1/index.m3u8"})</script>
            <video src="https://media.negahestan.com/x.mp4"></video>"#;
        assert_eq!(
            extract_live_stream_url(html, "live.negahestan.com").as_deref(),
            Some("https://live.negahestan.com/hls/ch1/index.m3u8")
        );
    }

    #[test]
    fn metadata_from_open_graph_and_markup() {
        let html = r#"<html><head>
            <meta property="og:title" content="The Salesman">
            <meta property="og:description" content="A couple's relationship &amp; a play.">
            <meta property="og:image" content="https://s.com/backdrop.jpg">
            <meta property="article:published_time" content="2017-02-01T08:00:00+00:00">
            <meta property="article:modified_time" content="2024-05-03T10:30:00+00:00">
            </head><body>
            <div class="poster"><img src="/poster.jpg"></div>
            <span class="date">Feb. 01, 2016</span>
            <span itemprop="ratingValue">7.8</span>
            <div class="sgeneros"><a href="/genres/drama/">Drama</a><a href="/genres/drama/">Drama</a></div>
            </body></html>"#;
        let base = Url::parse("https://s.com/movies/the-salesman/").unwrap();
        let meta = extract_metadata(html, Some(&base));
        assert_eq!(meta.title.as_deref(), Some("The Salesman"));
        assert_eq!(
            meta.description.as_deref(),
            Some("A couple's relationship & a play.")
        );
        assert_eq!(meta.poster_url.as_deref(), Some("https://s.com/poster.jpg"));
        assert_eq!(
            meta.backdrop_url.as_deref(),
            Some("https://s.com/backdrop.jpg")
        );
        assert_eq!(meta.year, Some(2016));
        assert_eq!(meta.rating, Some(7.8));
        assert_eq!(meta.genres, vec!["Drama".to_string()]);
        assert!(meta.modified_at > meta.published_at);
    }

    #[test]
    fn timestamps_without_offset_are_utc() {
        let ts = parse_timestamp("2024-01-05T10:00:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-01-05T10:00:00+00:00");
        assert!(parse_timestamp("2024-01-05").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn csrf_token_from_input_or_meta() {
        assert_eq!(
            extract_csrf_token(r#"<form><input type="hidden" name="_token" value="abc123"></form>"#)
                .as_deref(),
            Some("abc123")
        );
        assert_eq!(
            extract_csrf_token(r#"<meta name="csrf-token" content="xyz">"#).as_deref(),
            Some("xyz")
        );
        assert_eq!(extract_csrf_token("<form></form>"), None);
    }

    #[test]
    fn player_form_and_sources() {
        let page = r#"<form id="watch-4821" method="post">
            <input name="watch_episode_nonce" value="n0nce">
            <input name="_wp_http_referer" value="/movies/film/"></form>"#;
        assert_eq!(
            extract_player_form(page),
            Some(PlayerForm {
                post_id: "4821".to_string(),
                nonce: "n0nce".to_string(),
                referer: "/movies/film/".to_string(),
            })
        );

        let play = r#"
            <iframe src="https://farsiland.com/jwplayer/?source=https%3A%2F%2Fcdn.farsiland.com%2Fmovies%2Ffilm-1080p.mp4&id=1"></iframe>
            <script>var alt = "/jwplayer/?source=https%3A%2F%2Fcdn.farsiland.com%2Fmovies%2Ffilm-720p.mp4";
            var dup = "/jwplayer/?source=https%3A%2F%2Fcdn.farsiland.com%2Fmovies%2Ffilm-1080p.mp4";
            var img = "/thumb?source=https%3A%2F%2Fcdn.farsiland.com%2Fposter.jpg";</script>"#;
        let sources = extract_player_sources(play);
        assert_eq!(
            sources,
            vec![
                "https://cdn.farsiland.com/movies/film-1080p.mp4".to_string(),
                "https://cdn.farsiland.com/movies/film-720p.mp4".to_string(),
            ]
        );
        assert_eq!(detect_quality(&sources[0]), "1080p");
        assert_eq!(detect_quality(&sources[1]), "720p");
        assert_eq!(detect_quality("https://c.com/a-fhd.mp4"), "1080p");
        assert_eq!(detect_quality("https://c.com/a.mp4"), "HD");
        assert_eq!(cdn_label(&sources[0]).as_deref(), Some("cdn.farsiland.com"));
    }

    #[test]
    fn quality_comes_from_path_tokens_not_the_host() {
        assert_eq!(detect_quality("https://hdcdn.example/movies/film.mp4"), "HD");
        assert_eq!(detect_quality("https://cdn.example/720/film.mp4"), "720p");
        assert_eq!(detect_quality("https://cdn.example/movies/film_hd.mp4"), "720p");
        assert_eq!(detect_quality("https://cdn.example/movies/shadow.mp4"), "HD");
        assert_eq!(detect_quality("https://cdn1080.example/movies/film-480p.mp4"), "480p");
    }

    #[test]
    fn strip_html_decodes_entities() {
        assert_eq!(
            strip_html("<p>Tom &amp; Jerry&#8217;s <b>return</b></p>\n"),
            "Tom & Jerry\u{2019}s return"
        );
    }

    #[test]
    fn episode_kind_from_slug() {
        assert_eq!(
            kind_for_post_type("episodes", "khaneh-2x3"),
            ContentKind::Episode {
                series_slug: Some("khaneh".to_string()),
                season: 2,
                episode: 3
            }
        );
        assert_eq!(kind_for_post_type("tvshows", "khaneh"), ContentKind::Series);
        assert_eq!(kind_for_post_type("movies", "film"), ContentKind::Movie);
    }
}
