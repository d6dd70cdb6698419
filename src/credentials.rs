//! Saved login credentials.
//!
//! Storage encryption belongs to the host platform; this crate only needs an
//! opaque key-value store it can read, write and clear. The in-memory store
//! can be seeded from environment variables at startup.

use parking_lot::RwLock;
use std::fmt;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: &str, password: &str) -> Self {
        Self {
            email: email.to_string(),
            password: password.to_string(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Option<Credentials>;
    fn save(&self, credentials: &Credentials);
    fn clear(&self);
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    inner: RwLock<Option<Credentials>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            inner: RwLock::new(Some(credentials)),
        }
    }

    /// Seed from two environment variables; empty when either is unset.
    pub fn from_env(email_var: &str, password_var: &str) -> Self {
        match (std::env::var(email_var), std::env::var(password_var)) {
            (Ok(email), Ok(password)) if !email.is_empty() && !password.is_empty() => {
                Self::with_credentials(Credentials { email, password })
            }
            _ => Self::new(),
        }
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn load(&self) -> Option<Credentials> {
        self.inner.read().clone()
    }

    fn save(&self, credentials: &Credentials) {
        *self.inner.write() = Some(credentials.clone());
    }

    fn clear(&self) {
        *self.inner.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_the_password() {
        let creds = Credentials::new("a@b.com", "hunter2");
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("a@b.com"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn save_load_clear() {
        let store = InMemoryCredentialStore::new();
        assert!(store.load().is_none());
        store.save(&Credentials::new("a@b.com", "pw"));
        assert_eq!(store.load().unwrap().email, "a@b.com");
        store.clear();
        assert!(store.load().is_none());
    }

    #[test]
    fn env_seeding_requires_both_variables() {
        let store = InMemoryCredentialStore::from_env(
            "CATSYNC_TEST_UNSET_EMAIL_VAR",
            "CATSYNC_TEST_UNSET_PASSWORD_VAR",
        );
        assert!(store.load().is_none());
    }
}
