//! Credential provider seam.
//!
//! The engine never acquires credentials itself. A provider supplies the
//! current bearer headers and base URL, blocks until an initial token exists,
//! and refreshes on demand. Providers are expected to de-duplicate concurrent
//! refresh calls; several channels may hit an expired token at once.

use crate::error::EngineResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Supplies authentication for every connection the engine opens.
#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    /// Suspends until an initial token is available.
    async fn wait_for_ready(&self) -> EngineResult<()>;

    /// Forces a new token fetch.
    async fn refresh(&self) -> EngineResult<()>;

    /// Returns the headers to attach to every request.
    fn headers(&self) -> Vec<(String, String)>;

    /// Returns the server base URL, e.g. `https://host:9443`.
    fn base_url(&self) -> String;

    /// Returns true if a failed response means the token has expired.
    fn is_auth_expired(&self, status: u16, body: &str) -> bool {
        if status == 401 {
            return true;
        }
        let body = body.to_ascii_lowercase();
        status == 403 && (body.contains("expired") || body.contains("invalid token"))
    }
}

/// A provider with a fixed bearer token.
///
/// `refresh` only counts calls; swap the token with [`StaticCredentials::set_token`].
#[derive(Debug)]
pub struct StaticCredentials {
    base_url: String,
    token: RwLock<Option<String>>,
    refreshes: AtomicU64,
}

impl StaticCredentials {
    /// Creates a provider for `base_url` authenticating with `token`.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: RwLock::new(Some(token.into())),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Creates a provider that sends no authorization header.
    pub fn anonymous(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: RwLock::new(None),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Replaces the bearer token.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    /// Number of times `refresh` has been called.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn wait_for_ready(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn refresh(&self) -> EngineResult<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn headers(&self) -> Vec<(String, String)> {
        match self.token.read().as_deref() {
            Some(token) => vec![("Authorization".into(), format!("Bearer {token}"))],
            None => Vec::new(),
        }
    }

    fn base_url(&self) -> String {
        self.base_url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_header() {
        let creds = StaticCredentials::new("https://eda.local", "abc");
        assert_eq!(
            creds.headers(),
            vec![("Authorization".to_string(), "Bearer abc".to_string())]
        );
        creds.set_token("def");
        assert_eq!(creds.headers()[0].1, "Bearer def");
        assert!(StaticCredentials::anonymous("http://x").headers().is_empty());
    }

    #[test]
    fn default_expiry_predicate() {
        let creds = StaticCredentials::new("https://eda.local", "abc");
        assert!(creds.is_auth_expired(401, ""));
        assert!(creds.is_auth_expired(403, "Token Expired"));
        assert!(!creds.is_auth_expired(403, "forbidden"));
        assert!(!creds.is_auth_expired(500, "expired"));
    }

    #[tokio::test]
    async fn refresh_is_counted() {
        let creds = StaticCredentials::new("https://eda.local", "abc");
        creds.wait_for_ready().await.unwrap();
        creds.refresh().await.unwrap();
        creds.refresh().await.unwrap();
        assert_eq!(creds.refresh_count(), 2);
    }
}
