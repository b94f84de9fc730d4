//! Docker Hub registry implementation
//!
//! Tags are resolved through the Hub API, which needs no token. Resolving
//! the config digest of one platform's image goes through the registry API
//! with an anonymous pull token.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::DEFAULT_FETCH_TIMEOUT;
use crate::parser::types::{OFFICIAL_NAMESPACE, RegistryKind};
use crate::update::error::RegistryError;
use crate::update::registries::http::{build_client, check_response};
use crate::update::registries::manifest::ManifestClient;
use crate::update::registries::token::TokenCache;
use crate::update::registry::{LatestImage, Platform, Registry, RegistryQuery};

/// Default base URL for the Docker Hub API
pub const DEFAULT_BASE_URL: &str = "https://hub.docker.com";

/// Default base URL for the Docker Hub registry API
pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io";

/// Default base URL for the Docker Hub token service
pub const DEFAULT_AUTH_URL: &str = "https://auth.docker.io";

const TOKEN_SERVICE: &str = "registry.docker.io";

/// Response from the Docker Hub tag endpoint
#[derive(Debug, Deserialize)]
struct HubTag {
    name: String,
    digest: Option<String>,
    #[serde(default)]
    images: Vec<HubImage>,
}

/// One platform image of a tag
#[derive(Debug, Deserialize)]
struct HubImage {
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    os: String,
    digest: Option<String>,
}

impl HubTag {
    /// Manifest digest of the image built for `platform`
    fn platform_digest(&self, platform: &Platform) -> Option<&str> {
        self.images
            .iter()
            .find(|image| image.architecture == platform.architecture && image.os == platform.os)
            .and_then(|image| image.digest.as_deref())
    }
}

/// Registry implementation for Docker Hub
pub struct DockerHubRegistry {
    client: reqwest::Client,
    base_url: String,
    registry_url: String,
    auth_url: String,
    tokens: TokenCache,
}

impl DockerHubRegistry {
    /// Creates a new DockerHubRegistry with a custom base URL
    pub fn new(base_url: &str) -> Self {
        Self::with_timeout(base_url, DEFAULT_FETCH_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: build_client(timeout),
            base_url: base_url.trim_end_matches('/').to_string(),
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            tokens: TokenCache::new(),
        }
    }

    /// Overrides the registry API and token service endpoints
    pub fn with_endpoints(mut self, registry_url: &str, auth_url: &str) -> Self {
        self.registry_url = registry_url.trim_end_matches('/').to_string();
        self.auth_url = auth_url.trim_end_matches('/').to_string();
        self
    }

    /// Config digest of the platform manifest stored under `digest`
    async fn config_digest(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<Option<String>, RegistryError> {
        let url = format!(
            "{}/token?service={}&scope=repository:{}:pull",
            self.auth_url, TOKEN_SERVICE, repository
        );
        let token = self.tokens.fetch(&self.client, &url, repository).await?;

        let manifests = ManifestClient {
            client: &self.client,
            base_url: &self.registry_url,
            repository,
            token: token.as_deref(),
        };
        manifests.config_digest_of(digest).await.inspect_err(|e| {
            if matches!(e, RegistryError::Unauthorized(_)) {
                self.tokens.forget(repository);
            }
        })
    }
}

impl Default for DockerHubRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

#[async_trait::async_trait]
impl Registry for DockerHubRegistry {
    fn kind(&self) -> RegistryKind {
        RegistryKind::DockerHub
    }

    async fn fetch_latest(&self, query: &RegistryQuery) -> Result<LatestImage, RegistryError> {
        let namespace = query.namespace.as_deref().unwrap_or(OFFICIAL_NAMESPACE);
        let url = format!(
            "{}/v2/repositories/{}/{}/tags/{}",
            self.base_url, namespace, query.repository, query.tag
        );
        debug!("Querying Docker Hub: {}", url);

        let response = self.client.get(&url).send().await?;

        let subject = format!("{}/{}:{}", namespace, query.repository, query.tag);
        check_response(&response, &subject)?;

        let tag: HubTag = response.json().await.map_err(|e| {
            warn!("Failed to parse Docker Hub tag response: {}", e);
            RegistryError::InvalidResponse(e.to_string())
        })?;

        let config_digest = match query.platform.as_ref() {
            Some(platform) => match tag.platform_digest(platform) {
                Some(digest) => {
                    let repository = format!("{}/{}", namespace, query.repository);
                    self.config_digest(&repository, digest).await?
                }
                None => {
                    debug!(
                        "No {}/{} image for {}",
                        platform.os, platform.architecture, subject
                    );
                    None
                }
            },
            None => None,
        };

        Ok(LatestImage::new(tag.digest, Some(tag.name)).with_config_digest(config_digest))
    }
}
