//! Pull token cache shared by the registry clients
//!
//! Tokens are requested per repository from a registry token endpoint and
//! kept until shortly before they expire.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::update::error::RegistryError;
use crate::update::registries::http::check_response;

/// Lifetime assumed when the token endpoint does not report one
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

/// Tokens are dropped this long before they actually expire
const TOKEN_EXPIRY_MARGIN_SECS: u64 = 30;

/// Response from a registry token endpoint
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct TokenCache {
    tokens: Mutex<HashMap<String, CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Valid token for `repository`; an expired one is evicted
    pub fn get(&self, repository: &str) -> Option<String> {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = tokens.get(repository)
            && cached.expires_at > Instant::now()
        {
            return Some(cached.value.clone());
        }

        if tokens.remove(repository).is_some() {
            debug!("Pull token for {} expired", repository);
        }
        None
    }

    pub fn insert(&self, repository: &str, value: String, lifetime_secs: Option<u64>) {
        let lifetime = lifetime_secs
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS)
            .saturating_sub(TOKEN_EXPIRY_MARGIN_SECS);
        let now = Instant::now();

        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens.retain(|_, cached| cached.expires_at > now);
        tokens.insert(
            repository.to_string(),
            CachedToken {
                value,
                expires_at: now + Duration::from_secs(lifetime),
            },
        );
    }

    pub fn forget(&self, repository: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(repository);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns the pull token for `repository`, asking `url` when none is
    /// cached.
    ///
    /// `Ok(None)` means no anonymous token could be obtained; requests then
    /// go out unauthenticated and report 401 for private images. A rate
    /// limited token endpoint is an error.
    pub async fn fetch(
        &self,
        client: &reqwest::Client,
        url: &str,
        repository: &str,
    ) -> Result<Option<String>, RegistryError> {
        if let Some(token) = self.get(repository) {
            return Ok(Some(token));
        }

        debug!("Requesting pull token: {}", url);
        let response = client.get(url).send().await?;

        match check_response(&response, repository) {
            Ok(()) => {}
            Err(e @ RegistryError::RateLimited { .. }) => return Err(e),
            Err(e) => {
                debug!("Anonymous token unavailable for {}: {}", repository, e);
                return Ok(None);
            }
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            warn!("Failed to parse token response for {}: {}", repository, e);
            RegistryError::InvalidResponse(e.to_string())
        })?;

        self.insert(repository, token.token.clone(), token.expires_in);
        Ok(Some(token.token))
    }
}
