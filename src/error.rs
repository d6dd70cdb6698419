//! Failure taxonomy for source adapters.
//!
//! Expected failure modes never panic and never bubble up as opaque
//! `anyhow` errors: adapters return a [`ScrapeResult`] (or a [`FetchError`]
//! inside a `Result`) so callers can branch on the outcome.
//!
//! | Outcome | Retryable | Cursor |
//! |---------|-----------|--------|
//! | `NetworkError` | yes (next trigger) | left unadvanced |
//! | `ParseError` | no, selectors need an update | left unadvanced |
//! | `NoDataFound` | n/a, an empty result | advanced |
//! | `SecurityError` | no, request never sent | left unadvanced |
//! | `AuthError` | after re-login | left unadvanced |

use thiserror::Error;

/// Rejection by the security gate. The request is never sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    #[error("cleartext HTTP rejected: {url}")]
    CleartextRejected { url: String },

    #[error("untrusted domain '{host}': {url}")]
    ValidationFailed { url: String, host: String },
}

/// Classified login failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("login rate limited")]
    RateLimited,

    #[error("account suspended")]
    AccountSuspended,

    #[error("no saved credentials")]
    NoSavedCredentials,

    #[error("login failed: {0}")]
    Unknown(String),

    #[error("login request failed: {0}")]
    Fetch(String),
}

/// A classified adapter failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    /// Transport failure, timeout, or non-success HTTP status.
    #[error("network error: {0}")]
    Network(String),

    /// The markup no longer matches any selector / strategy.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),
}

impl FetchError {
    pub fn network(msg: impl Into<String>) -> Self {
        FetchError::Network(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        FetchError::Parse(msg.into())
    }

    /// Map a `reqwest` failure; timeouts keep "timed out" in the message.
    pub fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Network(format!("request timed out: {}", url))
        } else if err.is_connect() {
            FetchError::Network(format!("connection failed for {}: {}", url, err))
        } else {
            FetchError::Network(format!("request failed for {}: {}", url, err))
        }
    }
}

/// Tagged outcome of one adapter operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ScrapeResult<T> {
    Success(T),
    /// The fetch succeeded and the document was well-formed, but nothing matched.
    NoDataFound,
    NetworkError(String),
    ParseError(String),
    SecurityError(SecurityError),
    AuthError(AuthError),
}

impl<T> ScrapeResult<T> {
    /// Build from a fallible lookup; `Ok(None)` becomes [`ScrapeResult::NoDataFound`].
    pub fn from_result(result: Result<Option<T>, FetchError>) -> Self {
        match result {
            Ok(Some(value)) => ScrapeResult::Success(value),
            Ok(None) => ScrapeResult::NoDataFound,
            Err(err) => err.into(),
        }
    }

    /// Inverse of [`ScrapeResult::from_result`].
    pub fn into_result(self) -> Result<Option<T>, FetchError> {
        match self {
            ScrapeResult::Success(value) => Ok(Some(value)),
            ScrapeResult::NoDataFound => Ok(None),
            ScrapeResult::NetworkError(msg) => Err(FetchError::Network(msg)),
            ScrapeResult::ParseError(msg) => Err(FetchError::Parse(msg)),
            ScrapeResult::SecurityError(err) => Err(FetchError::Security(err)),
            ScrapeResult::AuthError(err) => Err(FetchError::Auth(err)),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ScrapeResult::Success(_))
    }

    /// `true` for the variants that represent a failure rather than a result.
    pub fn is_error(&self) -> bool {
        !matches!(self, ScrapeResult::Success(_) | ScrapeResult::NoDataFound)
    }

    pub fn ok(self) -> Option<T> {
        match self {
            ScrapeResult::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ScrapeResult<U> {
        match self {
            ScrapeResult::Success(value) => ScrapeResult::Success(f(value)),
            ScrapeResult::NoDataFound => ScrapeResult::NoDataFound,
            ScrapeResult::NetworkError(msg) => ScrapeResult::NetworkError(msg),
            ScrapeResult::ParseError(msg) => ScrapeResult::ParseError(msg),
            ScrapeResult::SecurityError(err) => ScrapeResult::SecurityError(err),
            ScrapeResult::AuthError(err) => ScrapeResult::AuthError(err),
        }
    }

    /// Human-readable failure message, if this is a failure.
    pub fn error_message(&self) -> Option<String> {
        match self {
            ScrapeResult::Success(_) | ScrapeResult::NoDataFound => None,
            ScrapeResult::NetworkError(msg) => Some(format!("network error: {}", msg)),
            ScrapeResult::ParseError(msg) => Some(format!("parse error: {}", msg)),
            ScrapeResult::SecurityError(err) => Some(format!("security error: {}", err)),
            ScrapeResult::AuthError(err) => Some(format!("auth error: {}", err)),
        }
    }
}

impl<T> From<FetchError> for ScrapeResult<T> {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Network(msg) => ScrapeResult::NetworkError(msg),
            FetchError::Parse(msg) => ScrapeResult::ParseError(msg),
            FetchError::Security(err) => ScrapeResult::SecurityError(err),
            FetchError::Auth(err) => ScrapeResult::AuthError(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_data_is_not_an_error() {
        let empty: ScrapeResult<u32> = ScrapeResult::from_result(Ok(None));
        assert_eq!(empty, ScrapeResult::NoDataFound);
        assert!(!empty.is_error());
        assert!(empty.error_message().is_none());
    }

    #[test]
    fn fetch_errors_map_to_tagged_variants() {
        let r: ScrapeResult<u32> = FetchError::parse("no selector matched").into();
        assert!(matches!(r, ScrapeResult::ParseError(_)));
        assert!(r.is_error());

        let sec = SecurityError::CleartextRejected {
            url: "http://a.com".to_string(),
        };
        let r: ScrapeResult<u32> = FetchError::from(sec.clone()).into();
        assert_eq!(r.clone().into_result(), Err(FetchError::Security(sec)));
        assert!(r.error_message().unwrap().contains("cleartext"));
    }

    #[test]
    fn map_preserves_failures() {
        let ok: ScrapeResult<u32> = ScrapeResult::Success(2);
        assert_eq!(ok.map(|v| v * 2), ScrapeResult::Success(4));
        let err: ScrapeResult<u32> = ScrapeResult::NetworkError("down".into());
        assert_eq!(err.map(|v| v * 2), ScrapeResult::NetworkError("down".into()));
    }
}
