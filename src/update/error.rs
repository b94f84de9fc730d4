use thiserror::Error;

use crate::update::status::UpdateStatusCode;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Status cache lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Registry request timed out")]
    Timeout,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Rate limited: retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("No registry client for host: {0}")]
    UnsupportedRegistry(String),
}

impl RegistryError {
    /// Status code this failure is reported as
    pub fn status_code(&self) -> UpdateStatusCode {
        match self {
            RegistryError::Unauthorized(_) => UpdateStatusCode::Unauthorized,
            RegistryError::NotFound(_) => UpdateStatusCode::NotFound,
            RegistryError::RateLimited { .. } => UpdateStatusCode::RateLimited,
            RegistryError::Network(_)
            | RegistryError::Timeout
            | RegistryError::InvalidResponse(_)
            | RegistryError::UnsupportedRegistry(_) => UpdateStatusCode::RegistryError,
        }
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RegistryError::Timeout
        } else {
            RegistryError::Network(e)
        }
    }
}
