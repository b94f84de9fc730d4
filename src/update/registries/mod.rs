//! Registry implementations for resolving the latest image digest

pub mod docker_hub;
pub mod ghcr;
pub mod http;
pub mod manifest;
pub mod token;

pub use docker_hub::DockerHubRegistry;
pub use ghcr::GhcrRegistry;
