//! Gate-checked HTTP fetcher shared by every adapter.
//!
//! Each request is validated by the [`SecurityGate`] before it is sent, and
//! every redirect hop is validated again by the client's redirect policy, so
//! no bytes are ever requested from an insecure or unlisted origin.
//!
//! Requests are plain `async` calls on a shared `reqwest::Client`. Dropping
//! the returned future aborts the in-flight request. Timeouts are
//! per-request and surface as [`FetchError::Network`]; nothing is retried
//! here.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, ORIGIN, REFERER};
use reqwest::redirect::Policy;
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, warn};

use crate::config::HttpConfig;
use crate::error::{FetchError, SecurityError};
use crate::security::SecurityGate;
use crate::session::SessionCookieStore;

const MAX_REDIRECTS: usize = 10;

/// A fetched response with its body read.
#[derive(Debug, Clone)]
pub struct Page {
    /// URL after redirects.
    pub url: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl Page {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Turn a non-2xx response into a [`FetchError::Network`].
    pub fn ensure_success(self) -> Result<Page, FetchError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(FetchError::network(format!(
                "HTTP {} for {}",
                self.status.as_u16(),
                self.url
            )))
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    gate: Arc<SecurityGate>,
    delay: Duration,
}

impl HttpFetcher {
    /// Build a fetcher. Pass a cookie store for sources that keep a session.
    pub fn new(
        config: &HttpConfig,
        gate: Arc<SecurityGate>,
        cookies: Option<Arc<SessionCookieStore>>,
    ) -> Result<Self> {
        let redirect_gate = Arc::clone(&gate);
        let policy = Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error("too many redirects");
            }
            match redirect_gate.check(attempt.url().as_str()) {
                Ok(_) => attempt.follow(),
                Err(err) => attempt.error(err),
            }
        });

        let mut builder = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.request_timeout())
            .timeout(config.request_timeout())
            .https_only(true)
            .redirect(policy);
        if let Some(store) = cookies {
            builder = builder.cookie_provider(store);
        }

        let client = builder.build().context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            gate,
            delay: config.request_delay(),
        })
    }

    pub fn gate(&self) -> &SecurityGate {
        &self.gate
    }

    /// Politeness pause between consecutive requests to the same site.
    pub async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    /// GET with optional query parameters. Any status is returned as a page.
    pub async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Page, FetchError> {
        let parsed = self.gate.check(url)?;
        let request = self.client.get(parsed).query(query);
        self.send(url, request).await
    }

    /// GET that fails on non-2xx status.
    pub async fn get_ok(&self, url: &str) -> Result<Page, FetchError> {
        self.get(url, &[]).await?.ensure_success()
    }

    /// POST a urlencoded form with `Referer`/`Origin` set to `referer`.
    pub async fn post_form(
        &self,
        url: &str,
        fields: &[(&str, &str)],
        referer: &str,
    ) -> Result<Page, FetchError> {
        let parsed = self.gate.check(url)?;
        let mut request = self.client.post(parsed).form(fields);
        if let Ok(referer_url) = self.gate.check(referer) {
            request = request
                .header(REFERER, referer_url.as_str())
                .header(ORIGIN, referer_url.origin().ascii_serialization());
        }
        self.send(url, request).await
    }

    async fn send(&self, url: &str, request: RequestBuilder) -> Result<Page, FetchError> {
        debug!(url, "fetching");
        let response = request
            .send()
            .await
            .map_err(|e| classify_send_error(url, &e))?;

        let status = response.status();
        let final_url = response.url().to_string();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))?;

        if !status.is_success() {
            debug!(url, status = status.as_u16(), "non-success status");
        }

        Ok(Page {
            url: final_url,
            status,
            headers,
            body,
        })
    }
}

/// Redirects refused by the gate come back as security errors.
fn classify_send_error(url: &str, err: &reqwest::Error) -> FetchError {
    if err.is_redirect() {
        let mut source = std::error::Error::source(err);
        while let Some(inner) = source {
            if let Some(security) = inner.downcast_ref::<SecurityError>() {
                warn!(url, error = %security, "redirect rejected");
                return FetchError::Security(security.clone());
            }
            source = inner.source();
        }
    }
    FetchError::from_reqwest(url, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher() -> HttpFetcher {
        let gate = Arc::new(SecurityGate::new(["farsiland.com"]));
        HttpFetcher::new(&HttpConfig::default(), gate, None).unwrap()
    }

    #[tokio::test]
    async fn cleartext_is_rejected_before_any_request() {
        let err = fetcher()
            .get("http://farsiland.com/wp-json/wp/v2/movies", &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::Security(SecurityError::CleartextRejected { .. })
        ));
    }

    #[tokio::test]
    async fn untrusted_domain_is_rejected_before_any_request() {
        let err = fetcher()
            .post_form("https://evil.example/login", &[("a", "b")], "https://farsiland.com/")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::Security(SecurityError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn non_success_page_becomes_network_error() {
        let page = Page {
            url: "https://farsiland.com/x".to_string(),
            status: StatusCode::SERVICE_UNAVAILABLE,
            headers: HeaderMap::new(),
            body: String::new(),
        };
        let err = page.ensure_success().unwrap_err();
        assert_eq!(
            err,
            FetchError::Network("HTTP 503 for https://farsiland.com/x".to_string())
        );
    }
}
