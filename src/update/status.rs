//! Update check outcomes shared by the scheduler, the cache and callers
//!
//! The numeric codes are an external contract: presentation layers match on
//! them, so they must never be renumbered.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Outcome code of one update check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum UpdateStatusCode {
    /// Running image matches the registry
    UpToDate = 0,
    /// Registry holds a newer image
    UpdateAvailable = 1,
    /// No check has completed yet
    NotChecked = 2,
    /// Registry refused anonymous or token access
    Unauthorized = 401,
    /// Repository or tag absent from the registry
    NotFound = 404,
    /// Registry quota exhausted, or a forced check came too soon
    RateLimited = 429,
    /// Timeout, 5xx, malformed response, unsupported registry or unusable reference
    RegistryError = 500,
}

impl UpdateStatusCode {
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Human-readable text for the code
    pub fn description(&self) -> &'static str {
        match self {
            UpdateStatusCode::UpToDate => "No update available.",
            UpdateStatusCode::UpdateAvailable => "Update available!",
            UpdateStatusCode::NotChecked => "Update status not yet checked.",
            UpdateStatusCode::Unauthorized => {
                "Unauthorized (registry credentials required or invalid)."
            }
            UpdateStatusCode::NotFound => "Image not found on registry.",
            UpdateStatusCode::RateLimited => "Registry rate limit reached.",
            UpdateStatusCode::RegistryError => "Registry/internal error.",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(UpdateStatusCode::UpToDate),
            1 => Some(UpdateStatusCode::UpdateAvailable),
            2 => Some(UpdateStatusCode::NotChecked),
            401 => Some(UpdateStatusCode::Unauthorized),
            404 => Some(UpdateStatusCode::NotFound),
            429 => Some(UpdateStatusCode::RateLimited),
            500 => Some(UpdateStatusCode::RegistryError),
            _ => None,
        }
    }
}

impl Serialize for UpdateStatusCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.code())
    }
}

/// Result of the most recent update check for one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatus {
    pub code: UpdateStatusCode,
    pub description: String,
    pub checked_at: Option<DateTime<Utc>>,
    pub latest_digest: Option<String>,
    pub latest_tag: Option<String>,
}

impl UpdateStatus {
    /// A status carrying only a code, with no registry data
    pub fn new(code: UpdateStatusCode) -> Self {
        Self {
            code,
            description: code.description().to_string(),
            checked_at: None,
            latest_digest: None,
            latest_tag: None,
        }
    }

    pub fn not_checked() -> Self {
        Self::new(UpdateStatusCode::NotChecked)
    }

    /// A successful check, carrying what the registry reported
    pub fn with_latest(
        code: UpdateStatusCode,
        latest_digest: Option<String>,
        latest_tag: Option<String>,
    ) -> Self {
        Self {
            latest_digest,
            latest_tag,
            ..Self::new(code)
        }
    }

    pub fn is_update_available(&self) -> bool {
        self.code == UpdateStatusCode::UpdateAvailable
    }
}

impl Default for UpdateStatus {
    fn default() -> Self {
        Self::not_checked()
    }
}
