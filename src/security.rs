//! Network security gate.
//!
//! Every URL is checked here before it is fetched or handed to a player:
//! the scheme must be `https` and the host must equal, or be a subdomain
//! of, an entry in the configured allow-list. The gate is pure over its
//! allow-list and has no side effects.

use url::Url;

use crate::error::SecurityError;

/// HTTPS-only, allow-listed URL validator.
#[derive(Debug, Clone)]
pub struct SecurityGate {
    allowed_domains: Vec<String>,
}

impl SecurityGate {
    /// Build a gate over the given domains (lower-cased, leading dots stripped).
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed_domains = domains
            .into_iter()
            .map(|d| d.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        Self { allowed_domains }
    }

    pub fn allowed_domains(&self) -> &[String] {
        &self.allowed_domains
    }

    /// `true` iff the scheme is exactly `https` (case-insensitive).
    ///
    /// Protocol-relative URLs (`//host/path`) have no scheme and are not secure.
    pub fn is_secure(&self, url: &str) -> bool {
        matches!(scheme_of(url), Some(scheme) if scheme.eq_ignore_ascii_case("https"))
            && Url::parse(url).is_ok()
    }

    /// `true` iff the host is allow-listed. Unparseable URLs are untrusted.
    pub fn is_trusted_domain(&self, url: &str) -> bool {
        match host_of(url) {
            Some(host) => self.is_trusted_host(&host),
            None => false,
        }
    }

    fn is_trusted_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.allowed_domains.iter().any(|domain| {
            host == *domain
                || (host.len() > domain.len()
                    && host.ends_with(domain.as_str())
                    && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
        })
    }

    /// Validate a URL for fetching.
    ///
    /// The domain is checked first, then the scheme; each failure has its own
    /// error. With `throw_on_failure == false` failures return `Ok(false)`.
    pub fn validate(&self, url: &str, throw_on_failure: bool) -> Result<bool, SecurityError> {
        match self.check(url) {
            Ok(_) => Ok(true),
            Err(err) if throw_on_failure => Err(err),
            Err(_) => Ok(false),
        }
    }

    /// Validate and parse a URL, returning the parsed form on success.
    pub fn check(&self, url: &str) -> Result<Url, SecurityError> {
        let parsed = Url::parse(url).map_err(|_| SecurityError::ValidationFailed {
            url: url.to_string(),
            host: "<invalid>".to_string(),
        })?;
        let host = parsed.host_str().unwrap_or_default().to_string();
        if !self.is_trusted_host(&host) {
            return Err(SecurityError::ValidationFailed {
                url: url.to_string(),
                host,
            });
        }
        if !self.is_secure(url) {
            return Err(if parsed.scheme() == "http" {
                SecurityError::CleartextRejected {
                    url: url.to_string(),
                }
            } else {
                SecurityError::ValidationFailed {
                    url: url.to_string(),
                    host,
                }
            });
        }
        Ok(parsed)
    }

    /// Upgrade a URL to `https` where allowed.
    ///
    /// - already `https`: returned unchanged
    /// - `http` on a trusted domain: the same string with only the scheme replaced
    /// - anything else: `None`
    pub fn normalize_to_https(&self, url: &str) -> Option<String> {
        let scheme = scheme_of(url)?;
        if scheme.eq_ignore_ascii_case("https") {
            return self.is_secure(url).then(|| url.to_string());
        }
        if scheme.eq_ignore_ascii_case("http") && self.is_trusted_domain(url) {
            return Some(format!("https{}", &url[scheme.len()..]));
        }
        None
    }

    /// A URL in the form the gate would fetch it: upgraded where allowed,
    /// `https`, and on an allow-listed host. `None` otherwise.
    ///
    /// Every URL written to the store goes through here.
    pub fn admit(&self, url: &str) -> Option<String> {
        let upgraded = self.normalize_to_https(url)?;
        self.check(&upgraded).ok().map(|_| upgraded)
    }

    /// Keep secure, trusted URLs; optionally upgrade trusted `http` ones; drop the rest.
    pub fn filter<I, S>(&self, urls: I, normalize_http: bool) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        urls.into_iter()
            .filter_map(|url| {
                let url = url.as_ref();
                if self.is_secure(url) && self.is_trusted_domain(url) {
                    Some(url.to_string())
                } else if normalize_http {
                    self.normalize_to_https(url)
                        .filter(|upgraded| self.is_trusted_domain(upgraded))
                } else {
                    None
                }
            })
            .collect()
    }
}

/// Scheme prefix of an absolute URL (`scheme://`), as written.
fn scheme_of(url: &str) -> Option<&str> {
    let idx = url.find("://")?;
    let scheme = &url[..idx];
    let valid = !scheme.is_empty()
        && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(scheme)
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .filter(|h| !h.is_empty())
}
