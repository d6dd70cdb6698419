//! CDN URL construction.
//!
//! Media files live on a separate origin from the catalog site, under names
//! derived from the page slug:
//!
//! ```text
//! {base}/series/episodes/{Series_Name}_{NN}.mp4
//! {base}/series/episodes/{Series_Name}_{NN}.jpg
//! {base}/series/{Series_Name}.jpg
//! {base}/movies/{MovieName}.mp4
//! {base}/movies/{MovieName}.jpg
//! ```
//!
//! Every function here is total and pure: the same inputs always give the
//! same URL, with no network access.

/// How hyphenated slug tokens are joined into a CDN file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingStyle {
    /// `bamdaade-khomaar` → `Bamdaade_Khomaar`
    Series,
    /// `bamdaade-khomaar` → `BamdaadeKhomaar`
    Movie,
}

/// Capitalize each hyphen-separated token of `slug` and join per `style`.
pub fn format_cdn_name(slug: &str, style: NamingStyle) -> String {
    let separator = match style {
        NamingStyle::Series => "_",
        NamingStyle::Movie => "",
    };
    slug.trim_matches('/')
        .split('-')
        .filter(|token| !token.is_empty())
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(separator)
}

fn capitalize(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnUrlBuilder {
    base: String,
}

impl CdnUrlBuilder {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn build_episode_url_from_slug(&self, series_slug: &str, episode: u32) -> String {
        format!(
            "{}/series/episodes/{}_{:02}.mp4",
            self.base,
            format_cdn_name(series_slug, NamingStyle::Series),
            episode
        )
    }

    pub fn build_episode_thumbnail_url(&self, series_slug: &str, episode: u32) -> String {
        format!(
            "{}/series/episodes/{}_{:02}.jpg",
            self.base,
            format_cdn_name(series_slug, NamingStyle::Series),
            episode
        )
    }

    pub fn build_series_poster_url(&self, series_slug: &str) -> String {
        format!(
            "{}/series/{}.jpg",
            self.base,
            format_cdn_name(series_slug, NamingStyle::Series)
        )
    }

    pub fn build_movie_url(&self, slug: &str) -> String {
        format!(
            "{}/movies/{}.mp4",
            self.base,
            format_cdn_name(slug, NamingStyle::Movie)
        )
    }

    pub fn build_movie_poster_url(&self, slug: &str) -> String {
        format!(
            "{}/movies/{}.jpg",
            self.base,
            format_cdn_name(slug, NamingStyle::Movie)
        )
    }
}

/// What `catsync cdn <slug>` should print.
#[derive(Debug, Clone, Copy, Default)]
pub struct CdnQuery {
    pub episode: Option<u32>,
    pub movie: bool,
    pub poster_only: bool,
}

/// Labelled URLs for a slug. Series posters are the default.
pub fn cdn_links(builder: &CdnUrlBuilder, slug: &str, query: CdnQuery) -> Vec<(&'static str, String)> {
    match (query.episode, query.movie, query.poster_only) {
        (Some(n), _, false) => vec![
            ("episode", builder.build_episode_url_from_slug(slug, n)),
            ("thumbnail", builder.build_episode_thumbnail_url(slug, n)),
        ],
        (Some(n), _, true) => vec![("thumbnail", builder.build_episode_thumbnail_url(slug, n))],
        (None, true, false) => vec![
            ("movie", builder.build_movie_url(slug)),
            ("poster", builder.build_movie_poster_url(slug)),
        ],
        (None, true, true) => vec![("poster", builder.build_movie_poster_url(slug))],
        (None, false, _) => vec![("poster", builder.build_series_poster_url(slug))],
    }
}
