//! Host-to-client lookup for registry dispatch
//!
//! Each supported registry kind has one client. A reference whose host maps
//! to no enabled client is reported as unsupported rather than routed to
//! Docker Hub, since the wrong backend could claim an update exists.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::UpdateCheckConfig;
use crate::parser::types::{RegistryKind, detect_registry_kind};
use crate::update::error::RegistryError;
use crate::update::registries::{DockerHubRegistry, GhcrRegistry, docker_hub, ghcr};
use crate::update::registry::Registry;

/// Environment variable holding a GHCR read token
pub const GHCR_TOKEN_ENV: &str = "GHCR_TOKEN";

/// Registry clients keyed by the kind of registry they serve
#[derive(Clone, Default)]
pub struct RegistrySet {
    registries: HashMap<RegistryKind, Arc<dyn Registry>>,
}

impl RegistrySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a client, replacing any previous one of the same kind
    pub fn with(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registries.insert(registry.kind(), registry);
        self
    }

    /// Finds the client responsible for a registry host
    pub fn for_host(&self, host: &str) -> Result<(RegistryKind, Arc<dyn Registry>), RegistryError> {
        detect_registry_kind(host)
            .and_then(|kind| self.registries.get(&kind).map(|r| (kind, r.clone())))
            .ok_or_else(|| RegistryError::UnsupportedRegistry(host.to_string()))
    }

    pub fn kinds(&self) -> Vec<RegistryKind> {
        self.registries.keys().copied().collect()
    }
}

/// Create the registry clients enabled by the configuration
pub fn create_default_registries(config: &UpdateCheckConfig) -> RegistrySet {
    let timeout = config.fetch_timeout();
    let mut registries = RegistrySet::new();

    let hub_config = &config.registries.docker_hub;
    if hub_config.enabled {
        let base_url = hub_config
            .base_url
            .as_deref()
            .unwrap_or(docker_hub::DEFAULT_BASE_URL);
        let registry = DockerHubRegistry::with_timeout(base_url, timeout).with_endpoints(
            hub_config
                .registry_url
                .as_deref()
                .unwrap_or(docker_hub::DEFAULT_REGISTRY_URL),
            hub_config
                .auth_url
                .as_deref()
                .unwrap_or(docker_hub::DEFAULT_AUTH_URL),
        );
        registries = registries.with(Arc::new(registry));
    }

    let ghcr_config = &config.registries.ghcr;
    if ghcr_config.enabled {
        let token = ghcr_config
            .token
            .clone()
            .or_else(|| std::env::var(GHCR_TOKEN_ENV).ok());
        let base_url = ghcr_config
            .base_url
            .as_deref()
            .unwrap_or(ghcr::DEFAULT_BASE_URL);
        let registry = GhcrRegistry::with_timeout(base_url, timeout).with_token(token);
        registries = registries.with(Arc::new(registry));
    }

    registries
}
