//! Session/CSRF token management for repository calls.
//!
//! The token is process-wide and lazily acquired. Many calls read it; only
//! the single-flight refresh routine writes it, so concurrent expiry
//! detection triggers at most one refresh.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use crate::{
    error::{RelayError, RelayResult},
    prelude::*,
};

/// Fetches a fresh session token. Seam between the refresh logic and the
/// repository's token endpoint, so the single-flight invariant is testable
/// without a live repository.
#[async_trait]
pub trait FetchToken: Send + Sync + 'static {
    async fn fetch(&self) -> RelayResult<String>;
}

/// Provides the session token used to authenticate repository calls.
pub struct TokenProvider {
    fetcher: Arc<dyn FetchToken>,

    /// The current token, if one has been acquired.
    current: RwLock<Option<String>>,

    /// Held for the duration of a refresh so concurrent expiry detection
    /// results in a single fetch.
    refresh_lock: Mutex<()>,
}

impl TokenProvider {
    /// Create a token provider for the given repository.
    pub fn new(
        base_url: String,
        username: Option<String>,
        password: Option<String>,
        call_timeout: Duration,
    ) -> Self {
        Self::with_fetcher(Arc::new(HttpTokenFetcher::new(
            base_url,
            username,
            password,
            call_timeout,
        )))
    }

    /// Create a token provider with an explicit fetcher.
    pub fn with_fetcher(fetcher: Arc<dyn FetchToken>) -> Self {
        Self {
            fetcher,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Get the current token, acquiring one if necessary.
    pub async fn token(&self) -> RelayResult<String> {
        if let Some(token) = self.current.read().await.clone() {
            return Ok(token);
        }
        self.refresh(None).await
    }

    /// Refresh the token after observing `stale` fail with 401. If another
    /// caller refreshed first, the newer token is returned without a fetch.
    #[instrument(level = "debug", skip_all)]
    pub async fn refresh(&self, stale: Option<&str>) -> RelayResult<String> {
        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        if let Some(token) = self.current.read().await.clone() {
            if stale != Some(token.as_str()) {
                return Ok(token);
            }
        }

        let token = self.fetcher.fetch().await?;
        *self.current.write().await = Some(token.clone());
        debug!("acquired repository session token");
        Ok(token)
    }
}

/// Fetches tokens from the repository's session-token endpoint.
pub struct HttpTokenFetcher {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

/// Response shape of the repository's session-token endpoint.
#[derive(Debug, Deserialize)]
struct SessionTokenResponse {
    token: String,
}

impl HttpTokenFetcher {
    pub fn new(
        base_url: String,
        username: Option<String>,
        password: Option<String>,
        call_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .expect("default TLS backend should be available");
        Self {
            client,
            base_url,
            username,
            password,
        }
    }
}

#[async_trait]
impl FetchToken for HttpTokenFetcher {
    async fn fetch(&self) -> RelayResult<String> {
        let mut url = self.base_url.clone();
        if !url.ends_with('/') {
            url.push('/');
        }
        url.push_str("session/token");

        let mut request = self.client.get(&url);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }
        let response = request
            .send()
            .await
            .map_err(|e| RelayError::Auth(format!("token request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Auth(format!(
                "token request failed with status {status}"
            )));
        }
        let body = response
            .json::<SessionTokenResponse>()
            .await
            .map_err(|e| RelayError::Auth(format!("failed to parse token response: {e}")))?;
        Ok(body.token)
    }
}
