//! Page URL → playable media URL.
//!
//! Three flows, all reported to health under
//! [`ContentSource::MediaUrlResolution`]:
//!
//! | Method | Looks for |
//! |--------|-----------|
//! | [`resolve_video`](MediaResolver::resolve_video) | `.mp4` on the CDN host, via the extraction strategy chain |
//! | [`resolve_live_stream`](MediaResolver::resolve_live_stream) | `.m3u8` on the live host |
//! | [`resolve_player_sources`](MediaResolver::resolve_player_sources) | the `watch-<id>` form posted to `{site}/play/`, then `source=` parameters |
//!
//! No URL leaves the resolver without passing the security gate; trusted
//! `http` URLs are upgraded to `https`.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::{CdnConfig, Config};
use crate::error::{FetchError, ScrapeResult, SecurityError};
use crate::health::{HealthPolicy, HealthTracker};
use crate::http::HttpFetcher;
use crate::markup::{
    cdn_label, detect_quality, extract_live_stream_url, extract_player_form,
    extract_player_sources, extract_video_url,
};
use crate::models::ContentSource;
use crate::security::SecurityGate;
use crate::store::SqliteStore;

/// One playable source found behind a player form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaSource {
    pub url: String,
    pub quality: String,
    /// Host serving the file.
    pub cdn: Option<String>,
}

impl MediaSource {
    /// Tag a single resolved URL with its quality and host.
    pub fn from_url(url: String) -> Self {
        Self {
            quality: detect_quality(&url).to_string(),
            cdn: cdn_label(&url),
            url,
        }
    }
}

pub struct MediaResolver {
    fetcher: HttpFetcher,
    health: Arc<HealthTracker>,
    video_host: String,
    live_host: String,
    legacy_hosts: Vec<String>,
}

impl MediaResolver {
    pub fn new(fetcher: HttpFetcher, health: Arc<HealthTracker>, cdn: &CdnConfig) -> Self {
        Self {
            fetcher,
            health,
            video_host: cdn.video_host.clone(),
            live_host: cdn.live_host.clone(),
            legacy_hosts: cdn.legacy_hosts.clone(),
        }
    }

    pub async fn resolve_video(&self, page_url: &str) -> ScrapeResult<String> {
        let result = self
            .resolve_single(page_url, |html| {
                extract_video_url(html, &self.video_host, &self.legacy_hosts)
            })
            .await;
        self.report(page_url, &result).await;
        result
    }

    pub async fn resolve_live_stream(&self, page_url: &str) -> ScrapeResult<String> {
        let result = self
            .resolve_single(page_url, |html| extract_live_stream_url(html, &self.live_host))
            .await;
        self.report(page_url, &result).await;
        result
    }

    /// Submit the page's player form and collect every gate-approved source.
    pub async fn resolve_player_sources(&self, page_url: &str) -> ScrapeResult<Vec<MediaSource>> {
        let result = self.player_sources(page_url).await;
        self.report(page_url, &result).await;
        result
    }

    async fn resolve_single(
        &self,
        page_url: &str,
        extract: impl Fn(&str) -> Option<String>,
    ) -> ScrapeResult<String> {
        let page = match self.fetcher.get_ok(page_url).await {
            Ok(page) => page,
            Err(err) => return err.into(),
        };
        match extract(&page.body) {
            Some(url) => match self.hand_off(&url) {
                Ok(url) => ScrapeResult::Success(url),
                Err(err) => ScrapeResult::SecurityError(err),
            },
            None => ScrapeResult::NoDataFound,
        }
    }

    async fn player_sources(&self, page_url: &str) -> ScrapeResult<Vec<MediaSource>> {
        let page = match self.fetcher.get_ok(page_url).await {
            Ok(page) => page,
            Err(err) => return err.into(),
        };
        let Some(form) = extract_player_form(&page.body) else {
            debug!(url = page_url, "no player form on page");
            return ScrapeResult::NoDataFound;
        };
        let Some(play_url) = play_endpoint(&page.url) else {
            return FetchError::parse(format!("cannot derive player endpoint from {}", page.url))
                .into();
        };

        let fields = [
            ("id", form.post_id.as_str()),
            ("watch_episode_nonce", form.nonce.as_str()),
            ("_wp_http_referer", form.referer.as_str()),
        ];
        let player = match self
            .fetcher
            .post_form(&play_url, &fields, &page.url)
            .await
            .and_then(|p| p.ensure_success())
        {
            Ok(player) => player,
            Err(err) => return err.into(),
        };

        let found = extract_player_sources(&player.body);
        let sources: Vec<MediaSource> = self
            .fetcher
            .gate()
            .filter(found.iter(), true)
            .into_iter()
            .map(MediaSource::from_url)
            .collect();

        if sources.len() < found.len() {
            warn!(
                url = page_url,
                rejected = found.len() - sources.len(),
                "player sources rejected by security gate"
            );
        }
        if sources.is_empty() {
            ScrapeResult::NoDataFound
        } else {
            ScrapeResult::Success(sources)
        }
    }

    fn hand_off(&self, url: &str) -> Result<String, SecurityError> {
        let gate = self.fetcher.gate();
        let candidate = gate
            .normalize_to_https(url)
            .unwrap_or_else(|| url.to_string());
        gate.check(&candidate).map(|_| candidate)
    }

    async fn report<T>(&self, page_url: &str, result: &ScrapeResult<T>) {
        let source = ContentSource::MediaUrlResolution;
        let recorded = match result.error_message() {
            None => self.health.record_success(source).await,
            Some(message) => {
                warn!(url = page_url, error = %message, "media resolution failed");
                self.health.record_failure(source, Some(&message)).await
            }
        };
        if let Err(e) = recorded {
            warn!(error = %e, "failed to record media resolution health");
        }
    }
}

/// Which flow `catsync resolve` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    Video,
    LiveStream,
    Player,
}

/// `catsync resolve <page-url>`: print the gate-approved media URL(s).
pub async fn run_resolve(config: &Config, page_url: &str, mode: ResolveMode, json: bool) -> Result<()> {
    let store = Arc::new(SqliteStore::open(config).await?);
    let health = Arc::new(HealthTracker::new(
        store.clone(),
        HealthPolicy::from(&config.health),
    ));
    let gate = Arc::new(SecurityGate::new(&config.security.allowed_domains));
    let fetcher = HttpFetcher::new(&config.http, gate, None)?;
    let resolver = MediaResolver::new(fetcher, health, &config.cdn);

    let result = match mode {
        ResolveMode::Video => resolver
            .resolve_video(page_url)
            .await
            .map(|url| vec![MediaSource::from_url(url)]),
        ResolveMode::LiveStream => resolver
            .resolve_live_stream(page_url)
            .await
            .map(|url| vec![MediaSource::from_url(url)]),
        ResolveMode::Player => resolver.resolve_player_sources(page_url).await,
    };
    store.pool().close().await;

    let sources = match result {
        ScrapeResult::Success(sources) => sources,
        ScrapeResult::NoDataFound => bail!("no media found on {}", page_url),
        other => bail!(
            "{}",
            other
                .error_message()
                .unwrap_or_else(|| "resolution failed".to_string())
        ),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&sources)?);
    } else {
        for source in &sources {
            println!(
                "{:<6} {:<28} {}",
                source.quality,
                source.cdn.as_deref().unwrap_or("-"),
                source.url
            );
        }
    }
    Ok(())
}

/// `{scheme}://{host}/play/` of the page's site.
fn play_endpoint(page_url: &str) -> Option<String> {
    Url::parse(page_url)
        .ok()?
        .join("/play/")
        .ok()
        .map(String::from)
}
