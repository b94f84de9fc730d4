//! Manifest retrieval over the OCI distribution API
//!
//! A tag usually points at an image index (manifest list) with one entry per
//! platform. The runtime records the config digest of the platform image as
//! its image id, so resolving that id means walking index, then platform
//! manifest, then `config.digest`.

use reqwest::header::ACCEPT;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::update::error::RegistryError;
use crate::update::registries::http::check_response;
use crate::update::registry::Platform;

/// Manifest media types accepted for a tag, index types first so multi-arch
/// images resolve to the same digest the runtime records
pub const INDEX_ACCEPT: &str = "application/vnd.oci.image.index.v1+json,\
    application/vnd.oci.image.manifest.v1+json,\
    application/vnd.docker.distribution.manifest.list.v2+json,\
    application/vnd.docker.distribution.manifest.v2+json";

/// Media types accepted for a single platform manifest
pub const IMAGE_MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json,\
    application/vnd.docker.distribution.manifest.v2+json";

pub const DIGEST_HEADER: &str = "docker-content-digest";

/// The parts of an index or image manifest used for update detection
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<ManifestEntry>,
    #[serde(default)]
    pub config: Option<Descriptor>,
}

#[derive(Debug, Deserialize)]
pub struct ManifestEntry {
    pub digest: String,
    #[serde(default)]
    pub platform: Option<PlatformSpec>,
}

#[derive(Debug, Deserialize)]
pub struct PlatformSpec {
    pub architecture: String,
    pub os: String,
}

#[derive(Debug, Deserialize)]
pub struct Descriptor {
    pub digest: String,
}

impl Manifest {
    pub fn is_index(&self) -> bool {
        let listed = self
            .media_type
            .as_deref()
            .is_some_and(|t| t.contains("manifest.list") || t.contains("image.index"));
        listed || (!self.manifests.is_empty() && self.config.is_none())
    }

    /// Digest of the index entry built for `platform`
    pub fn platform_digest(&self, platform: &Platform) -> Option<&str> {
        self.manifests
            .iter()
            .find(|entry| {
                entry.platform.as_ref().is_some_and(|p| {
                    p.architecture == platform.architecture && p.os == platform.os
                })
            })
            .map(|entry| entry.digest.as_str())
    }

    pub fn config_digest(&self) -> Option<&str> {
        self.config.as_ref().map(|config| config.digest.as_str())
    }
}

/// Reads manifests of one repository from a registry endpoint
pub struct ManifestClient<'a> {
    pub client: &'a reqwest::Client,
    /// Registry API root, e.g. `https://ghcr.io`
    pub base_url: &'a str,
    pub repository: &'a str,
    pub token: Option<&'a str>,
}

impl ManifestClient<'_> {
    fn url(&self, reference: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.base_url, self.repository, reference
        )
    }

    /// `GET` a manifest by tag or digest
    ///
    /// Returns the `Docker-Content-Digest` header, when present, with the
    /// parsed body.
    pub async fn get(
        &self,
        reference: &str,
        accept: &str,
    ) -> Result<(Option<String>, Manifest), RegistryError> {
        let url = self.url(reference);
        debug!("Fetching manifest: {}", url);

        let mut request = self.client.get(&url).header(ACCEPT, accept);
        if let Some(token) = self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        let subject = format!("{}@{}", self.repository, reference);
        check_response(&response, &subject)?;

        let digest = digest_header(&response);
        let manifest: Manifest = response.json().await.map_err(|e| {
            warn!("Failed to parse manifest {}: {}", subject, e);
            RegistryError::InvalidResponse(e.to_string())
        })?;

        Ok((digest, manifest))
    }

    /// Config digest of the image `manifest` resolves to for `platform`
    ///
    /// An image manifest carries it directly; an index is followed to its
    /// platform entry. `Ok(None)` when the index has no such platform.
    pub async fn config_digest_for(
        &self,
        manifest: &Manifest,
        platform: &Platform,
    ) -> Result<Option<String>, RegistryError> {
        if !manifest.is_index() {
            return Ok(manifest.config_digest().map(str::to_string));
        }

        let Some(digest) = manifest.platform_digest(platform) else {
            debug!(
                "No {}/{} image in index of {}",
                platform.os, platform.architecture, self.repository
            );
            return Ok(None);
        };

        self.config_digest_of(digest).await
    }

    /// Config digest of the platform manifest stored under `digest`
    pub async fn config_digest_of(&self, digest: &str) -> Result<Option<String>, RegistryError> {
        let (_, platform_manifest) = self.get(digest, IMAGE_MANIFEST_ACCEPT).await?;
        let config = platform_manifest.config_digest().map(str::to_string);
        if config.is_none() {
            warn!("Manifest {}@{} has no config", self.repository, digest);
        }
        Ok(config)
    }
}

pub fn digest_header(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(DIGEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
