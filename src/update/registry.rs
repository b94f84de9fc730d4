//! Registry trait for fetching the latest image metadata from upstream registries

#[cfg(test)]
use mockall::automock;

use crate::parser::image_ref::ImageReference;
use crate::parser::types::RegistryKind;
use crate::update::error::RegistryError;

/// OS used when the runtime reports none
pub const DEFAULT_OS: &str = "linux";

/// Platform an image was pulled for, in registry naming (`amd64`, `arm64`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

impl Platform {
    /// Builds a platform from runtime-reported values, falling back to the
    /// host architecture and Linux.
    pub fn new(architecture: Option<&str>, os: Option<&str>) -> Self {
        let architecture = architecture
            .filter(|a| !a.is_empty())
            .unwrap_or(std::env::consts::ARCH);
        Self {
            architecture: normalize_architecture(architecture).to_string(),
            os: os
                .filter(|o| !o.is_empty())
                .unwrap_or(DEFAULT_OS)
                .to_ascii_lowercase(),
        }
    }
}

/// Maps kernel architecture names onto the names used in image indexes
fn normalize_architecture(architecture: &str) -> &str {
    match architecture {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Unit of work sent to a registry client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryQuery {
    pub registry_host: String,
    pub namespace: Option<String>,
    pub repository: String,
    pub tag: String,
    /// When set, the client also resolves the config digest of the image
    /// built for this platform
    pub platform: Option<Platform>,
}

impl RegistryQuery {
    pub fn with_platform(mut self, platform: Option<Platform>) -> Self {
        self.platform = platform;
        self
    }

    /// Namespace and repository joined (e.g. `library/nginx`)
    pub fn repository_path(&self) -> String {
        match &self.namespace {
            Some(namespace) => format!("{}/{}", namespace, self.repository),
            None => self.repository.clone(),
        }
    }
}

impl From<&ImageReference> for RegistryQuery {
    fn from(reference: &ImageReference) -> Self {
        Self {
            registry_host: reference.registry_host().to_string(),
            namespace: reference.namespace().map(str::to_string),
            repository: reference.repository().to_string(),
            tag: reference.tag().to_string(),
            platform: None,
        }
    }
}

/// What a registry reports for the queried tag
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LatestImage {
    /// Manifest digest the tag currently points to
    pub digest: Option<String>,
    /// Tag the digest was resolved for
    pub tag: Option<String>,
    /// Config digest (image id) of the platform image, when a platform was
    /// queried
    pub config_digest: Option<String>,
}

impl LatestImage {
    pub fn new(digest: Option<String>, tag: Option<String>) -> Self {
        Self {
            digest,
            tag,
            config_digest: None,
        }
    }

    pub fn with_config_digest(mut self, config_digest: Option<String>) -> Self {
        self.config_digest = config_digest;
        self
    }
}

/// Trait for fetching the latest image metadata from a registry
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    /// Returns the kind of registry this implementation handles
    fn kind(&self) -> RegistryKind;

    /// Resolves the digest the queried tag currently points to
    ///
    /// # Returns
    /// * `Ok(LatestImage)` - Digest and tag reported by the registry
    /// * `Err(RegistryError)` - If the lookup fails; never retried here
    async fn fetch_latest(&self, query: &RegistryQuery) -> Result<LatestImage, RegistryError>;
}
