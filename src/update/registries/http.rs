//! Response classification shared by the registry clients

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use tracing::warn;

use crate::update::error::RegistryError;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Headers registries use to report the remaining pull quota
const RATE_LIMIT_REMAINING_HEADERS: &[&str] = &["ratelimit-remaining", "x-ratelimit-remaining"];

/// Creates the HTTP client used by a registry implementation
pub fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .expect("Failed to create HTTP client")
}

/// Maps a registry response onto a [`RegistryError`] when it is not usable.
///
/// A response is rate limited when it is a 429 or when its quota header says
/// nothing is left, whatever its status.
pub fn check_response(response: &reqwest::Response, subject: &str) -> Result<(), RegistryError> {
    let status = response.status();
    let headers = response.headers();

    if status == StatusCode::TOO_MANY_REQUESTS || quota_exhausted(headers) {
        return Err(RegistryError::RateLimited {
            retry_after_secs: retry_after_secs(headers),
        });
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(RegistryError::Unauthorized(subject.to_string()));
    }

    if status == StatusCode::NOT_FOUND {
        return Err(RegistryError::NotFound(subject.to_string()));
    }

    if !status.is_success() {
        warn!("Registry returned status {} for {}", status, response.url());
        return Err(RegistryError::InvalidResponse(format!(
            "Unexpected status: {}",
            status
        )));
    }

    Ok(())
}

/// True when any quota header reports zero remaining requests.
/// Accepts both `0` and the `0;w=21600` form Docker Hub sends.
pub fn quota_exhausted(headers: &HeaderMap) -> bool {
    RATE_LIMIT_REMAINING_HEADERS.iter().any(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .and_then(|v| v.trim().parse::<u64>().ok())
            == Some(0)
    })
}

pub fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
