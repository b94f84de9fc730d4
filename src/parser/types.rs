//! Common types for image references

/// Host used when an image reference names no registry
pub const DEFAULT_REGISTRY_HOST: &str = "docker.io";

/// Namespace injected for official images on the default registry
pub const OFFICIAL_NAMESPACE: &str = "library";

/// Tag used when an image reference names no tag
pub const DEFAULT_TAG: &str = "latest";

/// Host of the GitHub Container Registry
pub const GHCR_HOST: &str = "ghcr.io";

/// Hosts that all resolve to Docker Hub
const DOCKER_HUB_HOSTS: &[&str] = &[
    "docker.io",
    "docker.io:443",
    "index.docker.io",
    "index.docker.io:443",
    "registry-1.docker.io",
    "registry-1.docker.io:443",
];

/// Kind of upstream registry an image lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryKind {
    /// Docker Hub (nginx, grafana/loki, docker.io/library/redis)
    DockerHub,
    /// GitHub Container Registry (ghcr.io/org/app)
    Ghcr,
}

impl RegistryKind {
    /// Returns the string representation of the registry kind
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryKind::DockerHub => "docker_hub",
            RegistryKind::Ghcr => "ghcr",
        }
    }
}

impl std::fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RegistryKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker_hub" => Ok(RegistryKind::DockerHub),
            "ghcr" => Ok(RegistryKind::Ghcr),
            _ => Err(()),
        }
    }
}

/// Returns true if the host is one of the aliases of Docker Hub
pub fn is_docker_hub_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    DOCKER_HUB_HOSTS.contains(&host.as_str())
}

/// Detect the registry kind serving the given host.
///
/// Returns `None` for hosts no client exists for; callers must not fall back
/// to Docker Hub for those.
pub fn detect_registry_kind(host: &str) -> Option<RegistryKind> {
    if is_docker_hub_host(host) {
        Some(RegistryKind::DockerHub)
    } else if host.eq_ignore_ascii_case(GHCR_HOST) {
        Some(RegistryKind::Ghcr)
    } else {
        None
    }
}
