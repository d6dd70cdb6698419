//! Authenticated session context.
//!
//! A [`SessionContext`] is built once at startup for the authenticated
//! source and shared (via `Arc`) with its adapter. It owns the per-host
//! cookie store used by that source's HTTP client and drives the login
//! state machine:
//!
//! ```text
//! NotAuthenticated ─login─▶ Authenticating ─▶ Authenticated
//!        ▲                                        │ session check fails
//!        │                                        ▼
//!        └──── relogin fails ◀── Reauthenticating ◀── SessionCheckFailed
//! ```
//!
//! A session is never dropped silently: [`SessionContext::ensure_authenticated`]
//! always attempts a login with saved credentials before reporting failure.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use reqwest::header::HeaderValue;
use reqwest::StatusCode;
use tracing::{info, warn};
use url::Url;

use crate::config::{AuthenticatedSourceConfig, HttpConfig};
use crate::credentials::{CredentialStore, Credentials};
use crate::error::{AuthError, FetchError};
use crate::http::{HttpFetcher, Page};
use crate::markup::{extract_csrf_token, extract_form_errors};
use crate::security::SecurityGate;

// ============ Cookie store ============

/// Per-host cookie jar shared by concurrent requests.
///
/// Cookies are keyed by domain, then by name; a `Set-Cookie` for an
/// existing name replaces the old value. All access goes through one
/// `RwLock`, so parallel fetches never observe a half-applied update.
#[derive(Debug, Default)]
pub struct SessionCookieStore {
    jar: RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl SessionCookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, domain: &str, name: &str, value: &str) {
        self.jar
            .write()
            .entry(normalize_domain(domain))
            .or_default()
            .insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, domain: &str, name: &str) -> Option<String> {
        self.jar
            .read()
            .get(&normalize_domain(domain))
            .and_then(|cookies| cookies.get(name).cloned())
    }

    pub fn remove(&self, domain: &str, name: &str) {
        let mut jar = self.jar.write();
        let domain = normalize_domain(domain);
        if let Some(cookies) = jar.get_mut(&domain) {
            cookies.remove(name);
            if cookies.is_empty() {
                jar.remove(&domain);
            }
        }
    }

    pub fn clear(&self) {
        self.jar.write().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.jar.read().values().all(|c| c.is_empty())
    }

    /// `name=value; ...` for every cookie that applies to `host`.
    pub fn header_for_host(&self, host: &str) -> Option<String> {
        let host = normalize_domain(host);
        let jar = self.jar.read();
        let mut applicable: BTreeMap<&str, &str> = BTreeMap::new();
        // Parent domains first so the most specific host wins on name clashes.
        let mut domains: Vec<&String> = jar
            .keys()
            .filter(|d| host == **d || host.ends_with(&format!(".{}", d)))
            .collect();
        domains.sort_by_key(|d| d.len());
        for domain in domains {
            for (name, value) in &jar[domain] {
                applicable.insert(name, value);
            }
        }
        if applicable.is_empty() {
            return None;
        }
        Some(
            applicable
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Apply one `Set-Cookie` header value received from `host`.
    pub fn apply_set_cookie(&self, header: &str, host: &str) {
        let mut parts = header.split(';');
        let Some((name, value)) = parts
            .next()
            .and_then(|kv| kv.split_once('='))
            .map(|(n, v)| (n.trim(), v.trim().trim_matches('"')))
        else {
            return;
        };
        if name.is_empty() {
            return;
        }

        let mut domain = host.to_string();
        let mut expired = value.is_empty();
        for attr in parts {
            let Some((key, val)) = attr.split_once('=') else {
                continue;
            };
            let val = val.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "domain" if !val.is_empty() => {
                    let candidate = normalize_domain(val);
                    // A host may only set cookies for itself or a parent domain.
                    let host_norm = normalize_domain(host);
                    if host_norm == candidate || host_norm.ends_with(&format!(".{}", candidate)) {
                        domain = candidate;
                    }
                }
                "max-age" => {
                    if val.parse::<i64>().map(|secs| secs <= 0).unwrap_or(false) {
                        expired = true;
                    }
                }
                "expires" => {
                    if let Ok(at) = DateTime::parse_from_rfc2822(&val.replace('-', " ")) {
                        if at.with_timezone(&Utc) <= Utc::now() {
                            expired = true;
                        }
                    }
                }
                _ => {}
            }
        }

        if expired {
            self.remove(&domain, name);
        } else {
            self.set(&domain, name, value);
        }
    }
}

impl reqwest::cookie::CookieStore for SessionCookieStore {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let Some(host) = url.host_str() else {
            return;
        };
        for header in cookie_headers {
            if let Ok(value) = header.to_str() {
                self.apply_set_cookie(value, host);
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        if url.scheme() != "https" {
            return None;
        }
        let header = self.header_for_host(url.host_str()?)?;
        HeaderValue::from_str(&header).ok()
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_start_matches('.').to_ascii_lowercase()
}

// ============ Session state machine ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotAuthenticated,
    Authenticating,
    Authenticated,
    SessionCheckFailed,
    Reauthenticating,
}

/// Login state and cookies for the authenticated source.
pub struct SessionContext {
    config: AuthenticatedSourceConfig,
    base: String,
    fetcher: HttpFetcher,
    cookies: Arc<SessionCookieStore>,
    credentials: Arc<dyn CredentialStore>,
    state: Mutex<SessionState>,
    /// Serializes login attempts across concurrent callers.
    login_lock: tokio::sync::Mutex<()>,
}

impl SessionContext {
    pub fn new(
        config: AuthenticatedSourceConfig,
        http: &HttpConfig,
        gate: Arc<SecurityGate>,
        credentials: Arc<dyn CredentialStore>,
    ) -> anyhow::Result<Self> {
        let cookies = Arc::new(SessionCookieStore::new());
        let fetcher = HttpFetcher::new(http, gate, Some(Arc::clone(&cookies)))?;
        Ok(Self {
            base: config.base_url.trim_end_matches('/').to_string(),
            config,
            fetcher,
            cookies,
            credentials,
            state: Mutex::new(SessionState::NotAuthenticated),
            login_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Fetcher carrying this session's cookies.
    pub fn fetcher(&self) -> &HttpFetcher {
        &self.fetcher
    }

    pub fn cookies(&self) -> &SessionCookieStore {
        &self.cookies
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    /// Log in with explicit credentials; saves them on success.
    pub async fn login(&self, email: &str, password: &str) -> Result<(), AuthError> {
        let _guard = self.login_lock.lock().await;
        self.authenticate(&Credentials::new(email, password), SessionState::Authenticating)
            .await
    }

    pub async fn login_with_saved_credentials(&self) -> Result<(), AuthError> {
        let _guard = self.login_lock.lock().await;
        self.login_saved(SessionState::Authenticating).await
    }

    async fn login_saved(&self, during: SessionState) -> Result<(), AuthError> {
        let credentials = self
            .credentials
            .load()
            .ok_or(AuthError::NoSavedCredentials)?;
        self.authenticate(&credentials, during).await
    }

    /// Verify the session, re-logging in with saved credentials if needed.
    pub async fn ensure_authenticated(&self) -> Result<(), AuthError> {
        let _guard = self.login_lock.lock().await;

        if self.is_authenticated() {
            if self.check_session().await {
                return Ok(());
            }
            warn!(source = "authenticated_catalog", "session check failed, re-authenticating");
            self.set_state(SessionState::SessionCheckFailed);
            return self.login_saved(SessionState::Reauthenticating).await;
        }

        self.login_saved(SessionState::Authenticating).await
    }

    /// Forget the session. Saved credentials are kept for the next login.
    pub fn logout(&self) {
        self.cookies.clear();
        self.set_state(SessionState::NotAuthenticated);
        info!(source = "authenticated_catalog", "logged out");
    }

    async fn check_session(&self) -> bool {
        match self.fetcher.get_ok(&self.url(&self.config.protected_path)).await {
            Ok(page) => self.looks_authenticated(&page),
            Err(err) => {
                warn!(error = %err, "session check request failed");
                false
            }
        }
    }

    fn looks_authenticated(&self, page: &Page) -> bool {
        let login_path = normalize_path(&self.config.login_path);
        let landed_on_login = Url::parse(&page.url)
            .map(|u| normalize_path(u.path()) == login_path)
            .unwrap_or(false);
        !landed_on_login && contains_marker(&page.body, &self.config.authenticated_markers)
    }

    async fn authenticate(
        &self,
        credentials: &Credentials,
        during: SessionState,
    ) -> Result<(), AuthError> {
        self.set_state(during);
        match self.submit_login(credentials).await {
            Ok(()) => {
                self.credentials.save(credentials);
                self.set_state(SessionState::Authenticated);
                info!(source = "authenticated_catalog", "login succeeded");
                Ok(())
            }
            Err(err) => {
                self.set_state(SessionState::NotAuthenticated);
                warn!(source = "authenticated_catalog", error = %err, "login failed");
                Err(err)
            }
        }
    }

    async fn submit_login(&self, credentials: &Credentials) -> Result<(), AuthError> {
        let login_url = self.url(&self.config.login_path);
        let form_page = self
            .fetcher
            .get_ok(&login_url)
            .await
            .map_err(auth_fetch_error)?;

        let token = extract_csrf_token(&form_page.body);
        if token.is_none() {
            warn!(url = %login_url, "login form has no CSRF token, submitting without it");
        }

        let mut fields = vec![
            ("email", credentials.email.as_str()),
            ("password", credentials.password.as_str()),
        ];
        if let Some(token) = token.as_deref() {
            fields.push(("_token", token));
        }

        self.fetcher.pause().await;
        let response = self
            .fetcher
            .post_form(&login_url, &fields, &login_url)
            .await
            .map_err(auth_fetch_error)?;

        if response.status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AuthError::RateLimited);
        }

        let landed = Url::parse(&response.url)
            .map(|u| normalize_path(u.path()))
            .unwrap_or_default();
        let on_post_login = landed == normalize_path(&self.config.post_login_path)
            && landed != normalize_path(&self.config.login_path);
        if response.status.is_success()
            && (on_post_login || contains_marker(&response.body, &self.config.authenticated_markers))
        {
            return Ok(());
        }

        let messages = extract_form_errors(&response.body);
        let text = if messages.is_empty() {
            response.body.clone()
        } else {
            messages.join(" ")
        };
        Err(classify_login_failure(response.status, &text))
    }
}

/// Map a rejected login to its cause by status and message text.
pub fn classify_login_failure(status: StatusCode, message: &str) -> AuthError {
    let lower = message.to_lowercase();
    if status == StatusCode::TOO_MANY_REQUESTS
        || lower.contains("too many")
        || lower.contains("throttle")
        || lower.contains("try again later")
    {
        AuthError::RateLimited
    } else if lower.contains("suspended") || lower.contains("banned") || lower.contains("disabled")
    {
        AuthError::AccountSuspended
    } else if lower.contains("do not match")
        || lower.contains("invalid")
        || lower.contains("incorrect")
        || lower.contains("wrong password")
    {
        AuthError::InvalidCredentials
    } else {
        let snippet: String = message.split_whitespace().collect::<Vec<_>>().join(" ");
        AuthError::Unknown(snippet.chars().take(200).collect())
    }
}

fn auth_fetch_error(err: FetchError) -> AuthError {
    AuthError::Fetch(err.to_string())
}

fn contains_marker(body: &str, markers: &[String]) -> bool {
    let lower = body.to_lowercase();
    markers
        .iter()
        .any(|m| !m.is_empty() && lower.contains(&m.to_lowercase()))
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::InMemoryCredentialStore;
    use reqwest::cookie::CookieStore;

    fn auth_config(base: &str) -> AuthenticatedSourceConfig {
        toml::from_str(&format!("base_url = \"{}\"", base)).unwrap()
    }

    fn context(base: &str, store: Arc<InMemoryCredentialStore>) -> SessionContext {
        let gate = Arc::new(SecurityGate::new(["namakade.com"]));
        SessionContext::new(auth_config(base), &HttpConfig::default(), gate, store).unwrap()
    }

    #[test]
    fn same_named_cookie_is_replaced() {
        let store = SessionCookieStore::new();
        store.apply_set_cookie("session=one; Path=/; HttpOnly", "namakade.com");
        store.apply_set_cookie("session=two; Path=/", "namakade.com");
        store.apply_set_cookie("XSRF-TOKEN=abc; Path=/", "namakade.com");
        assert_eq!(store.get("namakade.com", "session").as_deref(), Some("two"));
        assert_eq!(
            store.header_for_host("namakade.com").as_deref(),
            Some("XSRF-TOKEN=abc; session=two")
        );
    }

    #[test]
    fn parent_domain_cookies_apply_to_subdomains() {
        let store = SessionCookieStore::new();
        store.apply_set_cookie("sid=1; Domain=.namakade.com", "www.namakade.com");
        store.apply_set_cookie("pref=x", "other.com");
        assert_eq!(
            store.header_for_host("media.namakade.com").as_deref(),
            Some("sid=1")
        );
        assert_eq!(store.header_for_host("evil.com"), None);
    }

    #[test]
    fn foreign_domain_attribute_is_ignored() {
        let store = SessionCookieStore::new();
        store.apply_set_cookie("sid=1; Domain=evil.com", "namakade.com");
        assert_eq!(store.get("namakade.com", "sid").as_deref(), Some("1"));
        assert_eq!(store.get("evil.com", "sid"), None);
    }

    #[test]
    fn expired_cookies_are_removed() {
        let store = SessionCookieStore::new();
        store.apply_set_cookie("sid=1", "namakade.com");
        store.apply_set_cookie("sid=gone; Max-Age=0", "namakade.com");
        assert!(store.is_empty());

        store.apply_set_cookie("sid=1", "namakade.com");
        store.apply_set_cookie(
            "sid=deleted; expires=Thu, 01 Jan 1970 00:00:00 GMT",
            "namakade.com",
        );
        assert!(store.get("namakade.com", "sid").is_none());
    }

    #[test]
    fn cookie_store_trait_only_sends_over_https() {
        let store = SessionCookieStore::new();
        let url = Url::parse("https://namakade.com/login").unwrap();
        let header = HeaderValue::from_static("sid=abc; Path=/");
        store.set_cookies(&mut std::iter::once(&header), &url);
        assert_eq!(store.cookies(&url).unwrap().to_str().unwrap(), "sid=abc");
        let insecure = Url::parse("http://namakade.com/login").unwrap();
        assert!(store.cookies(&insecure).is_none());
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        let store = Arc::new(SessionCookieStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for j in 0..100 {
                        store.set("namakade.com", &format!("c{}_{}", i, j), "v");
                        let _ = store.header_for_host("namakade.com");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let header = store.header_for_host("namakade.com").unwrap();
        assert_eq!(header.split("; ").count(), 800);
    }

    #[test]
    fn login_failures_are_classified() {
        let ok = StatusCode::OK;
        assert_eq!(
            classify_login_failure(ok, "These credentials do not match our records."),
            AuthError::InvalidCredentials
        );
        assert_eq!(
            classify_login_failure(ok, "Too many login attempts. Please try again in 60 seconds."),
            AuthError::RateLimited
        );
        assert_eq!(
            classify_login_failure(StatusCode::TOO_MANY_REQUESTS, ""),
            AuthError::RateLimited
        );
        assert_eq!(
            classify_login_failure(ok, "Your account has been suspended."),
            AuthError::AccountSuspended
        );
        assert!(matches!(
            classify_login_failure(ok, "Something odd happened"),
            AuthError::Unknown(_)
        ));
    }

    #[tokio::test]
    async fn ensure_without_saved_credentials_reports_it() {
        let ctx = context("https://namakade.com", Arc::new(InMemoryCredentialStore::new()));
        assert_eq!(
            ctx.ensure_authenticated().await,
            Err(AuthError::NoSavedCredentials)
        );
        assert_eq!(ctx.state(), SessionState::NotAuthenticated);
    }

    #[tokio::test]
    async fn login_over_cleartext_never_leaves_the_process() {
        let store = Arc::new(InMemoryCredentialStore::new());
        let ctx = context("http://namakade.com", Arc::clone(&store));
        let err = ctx.login("a@b.com", "pw").await.unwrap_err();
        match err {
            AuthError::Fetch(msg) => assert!(msg.contains("cleartext")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(ctx.state(), SessionState::NotAuthenticated);
        assert!(store.load().is_none());
    }

    #[test]
    fn logout_keeps_saved_credentials() {
        let store = Arc::new(InMemoryCredentialStore::with_credentials(Credentials::new(
            "a@b.com", "pw",
        )));
        let ctx = context("https://namakade.com", Arc::clone(&store));
        ctx.cookies().set("namakade.com", "sid", "1");
        ctx.set_state(SessionState::Authenticated);
        ctx.logout();
        assert_eq!(ctx.state(), SessionState::NotAuthenticated);
        assert!(ctx.cookies().is_empty());
        assert_eq!(store.load().unwrap().email, "a@b.com");
    }
}
