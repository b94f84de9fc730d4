//! Update decision and status storage contract

use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;

use crate::update::error::{CacheError, RegistryError};
use crate::update::registry::LatestImage;
use crate::update::status::{UpdateStatus, UpdateStatusCode};

/// Trait for storing and retrieving update status per container
#[cfg_attr(test, automock)]
pub trait StatusStore: Send + Sync + 'static {
    /// Last stored status, NotChecked when the container has none
    fn get(&self, container_id: &str) -> Result<UpdateStatus, CacheError>;

    /// Replace the status of a container, stamping it with `now`
    ///
    /// Returns the status as stored.
    fn put(
        &self,
        container_id: &str,
        status: UpdateStatus,
        now: DateTime<Utc>,
    ) -> Result<UpdateStatus, CacheError>;

    /// Whether the container should be checked at `now`
    fn is_due(&self, container_id: &str, now: DateTime<Utc>) -> Result<bool, CacheError>;

    /// Record a forced check at `now`
    ///
    /// Returns false (and records nothing) when the previous forced check of
    /// the same container is still within the guard interval.
    fn mark_forced(&self, container_id: &str, now: DateTime<Utc>) -> Result<bool, CacheError>;

    /// Make the container due on the next cycle, keeping its last status
    fn invalidate(&self, container_id: &str) -> Result<(), CacheError>;

    /// Drop everything known about the container
    fn remove(&self, container_id: &str) -> Result<(), CacheError>;
}

/// Strips the `sha256:` prefix and lowercases, so `sha256:ABC` and `abc` match
pub fn normalize_digest(digest: &str) -> String {
    let digest = digest.trim();
    let bare = digest
        .get(..7)
        .filter(|prefix| prefix.eq_ignore_ascii_case("sha256:"))
        .map_or(digest, |_| &digest[7..]);
    bare.to_ascii_lowercase()
}

/// Normalized, non-empty form of an optional digest
fn comparable(digest: Option<&str>) -> Option<String> {
    digest.map(normalize_digest).filter(|d| !d.is_empty())
}

/// What is known about the running image of a container
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentImage<'a> {
    /// Repo (manifest) digest
    pub digest: Option<&'a str>,
    /// Local image id, i.e. the config digest
    pub image_id: Option<&'a str>,
    pub tag: &'a str,
}

/// Decide whether the registry holds a newer image than the running one
///
/// Repo digests are authoritative when both sides have one. Without them the
/// image id is compared with the config digest of the platform image. Tags
/// are the last resort; a registry that reports no tag is taken to match.
pub fn compare_image(current: &CurrentImage<'_>, latest: &LatestImage) -> UpdateStatusCode {
    let digests = (
        comparable(current.digest),
        comparable(latest.digest.as_deref()),
    );
    if let (Some(current_digest), Some(latest_digest)) = digests {
        return if current_digest == latest_digest {
            UpdateStatusCode::UpToDate
        } else {
            UpdateStatusCode::UpdateAvailable
        };
    }

    let image_ids = (
        comparable(current.image_id),
        comparable(latest.config_digest.as_deref()),
    );
    if let (Some(current_id), Some(latest_id)) = image_ids {
        return if current_id == latest_id {
            UpdateStatusCode::UpToDate
        } else {
            UpdateStatusCode::UpdateAvailable
        };
    }

    match latest.tag.as_deref() {
        Some(latest_tag) if latest_tag != current.tag => UpdateStatusCode::UpdateAvailable,
        _ => UpdateStatusCode::UpToDate,
    }
}

/// Turn the outcome of one registry call into the status to store
pub fn status_from_result(
    current: &CurrentImage<'_>,
    result: &Result<LatestImage, RegistryError>,
) -> UpdateStatus {
    match result {
        Ok(latest) => UpdateStatus::with_latest(
            compare_image(current, latest),
            latest.digest.clone(),
            latest.tag.clone(),
        ),
        Err(e) => UpdateStatus::new(e.status_code()),
    }
}
