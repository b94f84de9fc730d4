//! GitHub Container Registry implementation
//!
//! Resolves a tag through the OCI distribution API: an anonymous pull token is
//! requested per repository (unless a token is configured), then a `HEAD` on
//! the manifest yields the `Docker-Content-Digest` header. When a platform is
//! queried the manifest is fetched instead and followed to the config digest
//! of that platform's image.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use tracing::{debug, warn};

use crate::config::DEFAULT_FETCH_TIMEOUT;
use crate::parser::types::{GHCR_HOST, RegistryKind};
use crate::update::error::RegistryError;
use crate::update::registries::http::{build_client, check_response};
use crate::update::registries::manifest::{INDEX_ACCEPT, ManifestClient, digest_header};
use crate::update::registries::token::TokenCache;
use crate::update::registry::{LatestImage, Registry, RegistryQuery};

/// Default base URL for the GitHub Container Registry
pub const DEFAULT_BASE_URL: &str = "https://ghcr.io";

/// Registry implementation for ghcr.io
pub struct GhcrRegistry {
    client: reqwest::Client,
    base_url: String,
    configured_token: Option<String>,
    tokens: TokenCache,
}

impl GhcrRegistry {
    /// Creates a new GhcrRegistry with a custom base URL
    pub fn new(base_url: &str) -> Self {
        Self::with_timeout(base_url, DEFAULT_FETCH_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: build_client(timeout),
            base_url: base_url.trim_end_matches('/').to_string(),
            configured_token: None,
            tokens: TokenCache::new(),
        }
    }

    /// Uses a fixed token (e.g. a personal access token) instead of
    /// requesting anonymous ones
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.configured_token = token.filter(|t| !t.is_empty());
        self
    }

    async fn bearer_token(&self, repository: &str) -> Result<Option<String>, RegistryError> {
        if let Some(token) = &self.configured_token {
            return Ok(Some(token.clone()));
        }

        let url = format!(
            "{}/token?service={}&scope=repository:{}:pull",
            self.base_url, GHCR_HOST, repository
        );
        self.tokens.fetch(&self.client, &url, repository).await
    }

    /// Digest of the tag from a `HEAD` on its manifest
    async fn head_digest(
        &self,
        repository: &str,
        tag: &str,
        token: Option<&str>,
    ) -> Result<String, RegistryError> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, repository, tag);
        debug!("Querying ghcr.io manifest: {}", url);

        let mut request = self.client.head(&url).header(ACCEPT, INDEX_ACCEPT);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            self.tokens.forget(repository);
        }

        let subject = format!("{}:{}", repository, tag);
        check_response(&response, &subject)?;

        digest_header(&response).ok_or_else(|| {
            warn!("ghcr.io returned no digest header for {}", subject);
            RegistryError::InvalidResponse("missing Docker-Content-Digest header".to_string())
        })
    }
}

impl Default for GhcrRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

#[async_trait::async_trait]
impl Registry for GhcrRegistry {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Ghcr
    }

    async fn fetch_latest(&self, query: &RegistryQuery) -> Result<LatestImage, RegistryError> {
        let repository = query.repository_path();
        let token = self.bearer_token(&repository).await?;

        let Some(platform) = &query.platform else {
            let digest = self
                .head_digest(&repository, &query.tag, token.as_deref())
                .await?;
            return Ok(LatestImage::new(Some(digest), Some(query.tag.clone())));
        };

        let manifests = ManifestClient {
            client: &self.client,
            base_url: &self.base_url,
            repository: &repository,
            token: token.as_deref(),
        };

        let (digest, manifest) = manifests
            .get(&query.tag, INDEX_ACCEPT)
            .await
            .inspect_err(|e| {
                if matches!(e, RegistryError::Unauthorized(_)) {
                    self.tokens.forget(&repository);
                }
            })?;
        let config_digest = manifests.config_digest_for(&manifest, platform).await?;

        Ok(LatestImage::new(digest, Some(query.tag.clone())).with_config_digest(config_digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::image_ref::ImageReference;
    use crate::update::registries::manifest::IMAGE_MANIFEST_ACCEPT;
    use crate::update::registry::Platform;
    use mockito::{Matcher, Server, ServerGuard};

    fn query(image: &str) -> RegistryQuery {
        RegistryQuery::from(&ImageReference::parse(image))
    }

    async fn mock_token(server: &mut ServerGuard, repository: &str, token: &str) -> mockito::Mock {
        server
            .mock("GET", "/token")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("service".into(), "ghcr.io".into()),
                Matcher::UrlEncoded("scope".into(), format!("repository:{}:pull", repository)),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(r#"{{"token": "{}"}}"#, token))
            .create_async()
            .await
    }

    fn platform_query(image: &str, architecture: &str) -> RegistryQuery {
        query(image).with_platform(Some(Platform::new(Some(architecture), Some("linux"))))
    }

    #[tokio::test]
    async fn fetch_latest_with_platform_walks_index_to_config_digest() {
        let mut server = Server::new_async().await;
        let _token_mock = mock_token(&mut server, "org/app", "anon").await;

        let index_mock = server
            .mock("GET", "/v2/org/app/manifests/v2")
            .match_header("authorization", "Bearer anon")
            .with_status(200)
            .with_header("content-type", "application/vnd.oci.image.index.v1+json")
            .with_header("docker-content-digest", "sha256:index")
            .with_body(
                r#"{
                    "schemaVersion": 2,
                    "mediaType": "application/vnd.oci.image.index.v1+json",
                    "manifests": [
                        { "digest": "sha256:amd", "platform": { "architecture": "amd64", "os": "linux" } },
                        { "digest": "sha256:arm", "platform": { "architecture": "arm64", "os": "linux" } }
                    ]
                }"#,
            )
            .create_async()
            .await;

        let platform_mock = server
            .mock("GET", "/v2/org/app/manifests/sha256:arm")
            .match_header("authorization", "Bearer anon")
            .match_header("accept", IMAGE_MANIFEST_ACCEPT)
            .with_status(200)
            .with_header("content-type", "application/vnd.oci.image.manifest.v1+json")
            .with_body(
                r#"{
                    "schemaVersion": 2,
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "config": { "digest": "sha256:armconfig" },
                    "layers": []
                }"#,
            )
            .create_async()
            .await;

        let registry = GhcrRegistry::new(&server.url());
        let result = registry
            .fetch_latest(&platform_query("ghcr.io/org/app:v2", "aarch64"))
            .await
            .unwrap();

        index_mock.assert_async().await;
        platform_mock.assert_async().await;
        assert_eq!(
            result,
            LatestImage::new(Some("sha256:index".to_string()), Some("v2".to_string()))
                .with_config_digest(Some("sha256:armconfig".to_string()))
        );
    }

    #[tokio::test]
    async fn fetch_latest_with_platform_reads_config_of_single_manifest() {
        let mut server = Server::new_async().await;
        let _token_mock = mock_token(&mut server, "org/app", "anon").await;

        let manifest_mock = server
            .mock("GET", "/v2/org/app/manifests/latest")
            .with_status(200)
            .with_header("docker-content-digest", "sha256:single")
            .with_body(
                r#"{
                    "schemaVersion": 2,
                    "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                    "config": { "digest": "sha256:cfg" }
                }"#,
            )
            .create_async()
            .await;

        let registry = GhcrRegistry::new(&server.url());
        let result = registry
            .fetch_latest(&platform_query("ghcr.io/org/app", "amd64"))
            .await
            .unwrap();

        manifest_mock.assert_async().await;
        assert_eq!(result.digest.as_deref(), Some("sha256:single"));
        assert_eq!(result.config_digest.as_deref(), Some("sha256:cfg"));
    }

    #[tokio::test]
    async fn fetch_latest_with_unlisted_platform_has_no_config_digest() {
        let mut server = Server::new_async().await;
        let _token_mock = mock_token(&mut server, "org/app", "anon").await;

        let index_mock = server
            .mock("GET", "/v2/org/app/manifests/latest")
            .with_status(200)
            .with_header("docker-content-digest", "sha256:index")
            .with_body(
                r#"{
                    "mediaType": "application/vnd.oci.image.index.v1+json",
                    "manifests": [
                        { "digest": "sha256:amd", "platform": { "architecture": "amd64", "os": "linux" } }
                    ]
                }"#,
            )
            .create_async()
            .await;

        let registry = GhcrRegistry::new(&server.url());
        let result = registry
            .fetch_latest(&platform_query("ghcr.io/org/app", "riscv64"))
            .await
            .unwrap();

        index_mock.assert_async().await;
        assert_eq!(result.digest.as_deref(), Some("sha256:index"));
        assert_eq!(result.config_digest, None);
    }

    #[tokio::test]
    async fn fetch_latest_requests_new_token_after_expiry() {
        let mut server = Server::new_async().await;

        // expires_in below the safety margin leaves no usable lifetime
        let token_mock = server
            .mock("GET", "/token")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token": "short", "expires_in": 10}"#)
            .expect(2)
            .create_async()
            .await;

        let manifest_mock = server
            .mock("HEAD", "/v2/org/app/manifests/latest")
            .match_header("authorization", "Bearer short")
            .with_status(200)
            .with_header("docker-content-digest", "sha256:cccc")
            .expect(2)
            .create_async()
            .await;

        let registry = GhcrRegistry::new(&server.url());
        registry.fetch_latest(&query("ghcr.io/org/app")).await.unwrap();
        registry.fetch_latest(&query("ghcr.io/org/app")).await.unwrap();

        token_mock.assert_async().await;
        manifest_mock.assert_async().await;
        assert_eq!(registry.tokens.len(), 1);
    }

    #[tokio::test]
    async fn fetch_latest_returns_digest_header_using_anonymous_token() {
        let mut server = Server::new_async().await;
        let token_mock = mock_token(&mut server, "org/app", "anon").await;

        let manifest_mock = server
            .mock("HEAD", "/v2/org/app/manifests/v2")
            .match_header("authorization", "Bearer anon")
            .with_status(200)
            .with_header("docker-content-digest", "sha256:cccc")
            .create_async()
            .await;

        let registry = GhcrRegistry::new(&server.url());
        let result = registry.fetch_latest(&query("ghcr.io/org/app:v2")).await.unwrap();

        token_mock.assert_async().await;
        manifest_mock.assert_async().await;
        assert_eq!(
            result,
            LatestImage::new(Some("sha256:cccc".to_string()), Some("v2".to_string()))
        );
    }

    #[tokio::test]
    async fn fetch_latest_reuses_cached_token() {
        let mut server = Server::new_async().await;
        let token_mock = mock_token(&mut server, "org/app", "anon").await;

        let manifest_mock = server
            .mock("HEAD", "/v2/org/app/manifests/latest")
            .match_header("authorization", "Bearer anon")
            .with_status(200)
            .with_header("docker-content-digest", "sha256:cccc")
            .expect(2)
            .create_async()
            .await;

        let registry = GhcrRegistry::new(&server.url());
        registry.fetch_latest(&query("ghcr.io/org/app")).await.unwrap();
        registry.fetch_latest(&query("ghcr.io/org/app")).await.unwrap();

        token_mock.assert_async().await;
        manifest_mock.assert_async().await;
    }

    #[tokio::test]
    async fn fetch_latest_with_configured_token_skips_token_endpoint() {
        let mut server = Server::new_async().await;

        let token_mock = server
            .mock("GET", "/token")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let manifest_mock = server
            .mock("HEAD", "/v2/org/private/manifests/latest")
            .match_header("authorization", "Bearer pat-123")
            .with_status(200)
            .with_header("docker-content-digest", "sha256:dddd")
            .create_async()
            .await;

        let registry = GhcrRegistry::new(&server.url()).with_token(Some("pat-123".to_string()));
        let result = registry.fetch_latest(&query("ghcr.io/org/private")).await.unwrap();

        token_mock.assert_async().await;
        manifest_mock.assert_async().await;
        assert_eq!(result.digest.as_deref(), Some("sha256:dddd"));
    }

    #[tokio::test]
    async fn fetch_latest_returns_unauthorized_when_no_token_is_granted() {
        let mut server = Server::new_async().await;

        let token_mock = server
            .mock("GET", "/token")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let manifest_mock = server
            .mock("HEAD", "/v2/org/private/manifests/latest")
            .with_status(401)
            .create_async()
            .await;

        let registry = GhcrRegistry::new(&server.url());
        let result = registry.fetch_latest(&query("ghcr.io/org/private")).await;

        token_mock.assert_async().await;
        manifest_mock.assert_async().await;
        assert!(matches!(result, Err(RegistryError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn fetch_latest_returns_not_found_for_missing_manifest() {
        let mut server = Server::new_async().await;
        let _token_mock = mock_token(&mut server, "org/app", "anon").await;

        let manifest_mock = server
            .mock("HEAD", "/v2/org/app/manifests/nope")
            .with_status(404)
            .create_async()
            .await;

        let registry = GhcrRegistry::new(&server.url());
        let result = registry.fetch_latest(&query("ghcr.io/org/app:nope")).await;

        manifest_mock.assert_async().await;
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn fetch_latest_returns_rate_limited_for_429() {
        let mut server = Server::new_async().await;
        let _token_mock = mock_token(&mut server, "org/app", "anon").await;

        let manifest_mock = server
            .mock("HEAD", "/v2/org/app/manifests/latest")
            .with_status(429)
            .with_header("retry-after", "30")
            .create_async()
            .await;

        let registry = GhcrRegistry::new(&server.url());
        let result = registry.fetch_latest(&query("ghcr.io/org/app")).await;

        manifest_mock.assert_async().await;
        assert!(matches!(
            result,
            Err(RegistryError::RateLimited {
                retry_after_secs: Some(30)
            })
        ));
    }

    #[tokio::test]
    async fn fetch_latest_returns_rate_limited_when_token_endpoint_is_limited() {
        let mut server = Server::new_async().await;

        let token_mock = server
            .mock("GET", "/token")
            .match_query(Matcher::Any)
            .with_status(429)
            .create_async()
            .await;

        let registry = GhcrRegistry::new(&server.url());
        let result = registry.fetch_latest(&query("ghcr.io/org/app")).await;

        token_mock.assert_async().await;
        assert!(matches!(result, Err(RegistryError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn fetch_latest_returns_invalid_response_without_digest_header() {
        let mut server = Server::new_async().await;
        let _token_mock = mock_token(&mut server, "org/app", "anon").await;

        let manifest_mock = server
            .mock("HEAD", "/v2/org/app/manifests/latest")
            .with_status(200)
            .create_async()
            .await;

        let registry = GhcrRegistry::new(&server.url());
        let result = registry.fetch_latest(&query("ghcr.io/org/app")).await;

        manifest_mock.assert_async().await;
        assert!(matches!(result, Err(RegistryError::InvalidResponse(_))));
    }
}
