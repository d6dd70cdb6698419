//! Authenticated scraping adapter.
//!
//! Wraps a [`ScrapeAdapter`] whose fetcher carries the session cookies. Each
//! pass first makes sure the session is live (re-logging in with saved
//! credentials when the check fails), then scrapes as usual. A refused login
//! fails the whole pass with an [`AuthError`](crate::error::AuthError).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::connector_scrape::ScrapeAdapter;
use crate::error::FetchError;
use crate::models::ContentSource;
use crate::session::SessionContext;
use crate::traits::{Harvest, SourceAdapter};

pub struct AuthenticatedAdapter {
    session: Arc<SessionContext>,
    scrape: ScrapeAdapter,
}

impl AuthenticatedAdapter {
    pub fn new(session: Arc<SessionContext>, scrape: ScrapeAdapter) -> Self {
        Self { session, scrape }
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }
}

#[async_trait]
impl SourceAdapter for AuthenticatedAdapter {
    fn source(&self) -> ContentSource {
        ContentSource::AuthenticatedCatalog
    }

    fn description(&self) -> &str {
        "Scraped pages behind a login session"
    }

    async fn fetch_candidates(&self, _cutoff: Option<DateTime<Utc>>) -> Result<Harvest, FetchError> {
        if let Err(err) = self.session.ensure_authenticated().await {
            warn!(source = %self.source(), error = %err, "not authenticated");
            return Err(FetchError::Auth(err));
        }
        self.scrape.harvest().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdn::CdnUrlBuilder;
    use crate::config::{AuthenticatedSourceConfig, HttpConfig};
    use crate::connector_scrape::ScrapeTarget;
    use crate::credentials::InMemoryCredentialStore;
    use crate::error::AuthError;
    use crate::security::SecurityGate;
    use crate::session::SessionState;

    fn auth_config() -> AuthenticatedSourceConfig {
        toml::from_str(r#"base_url = "https://members.namakade.com""#).unwrap()
    }

    #[tokio::test]
    async fn pass_without_credentials_fails_with_auth_error() {
        let gate = Arc::new(SecurityGate::new(["namakade.com"]));
        let session = Arc::new(
            SessionContext::new(
                auth_config(),
                &HttpConfig::default(),
                Arc::clone(&gate),
                Arc::new(InMemoryCredentialStore::new()),
            )
            .unwrap(),
        );
        let scrape = ScrapeAdapter::new(
            ContentSource::AuthenticatedCatalog,
            ScrapeTarget {
                base_url: "https://members.namakade.com".to_string(),
                categories: Vec::new(),
                card_selectors: Vec::new(),
                fetch_episodes: true,
                video_host: "media.negahestan.com".to_string(),
                legacy_hosts: Vec::new(),
                max_detail_pages: 10,
            },
            session.fetcher().clone(),
            CdnUrlBuilder::new("https://media.negahestan.com/ipnx/media"),
        );
        let adapter = AuthenticatedAdapter::new(Arc::clone(&session), scrape);

        let err = adapter.fetch_candidates(None).await.unwrap_err();
        assert_eq!(err, FetchError::Auth(AuthError::NoSavedCredentials));
        assert_eq!(adapter.session().state(), SessionState::NotAuthenticated);
    }
}
