use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

// =============================================================================
// Time-related constants
// =============================================================================

/// Default hour of day (local time) for the daily update check
pub const DEFAULT_CHECK_HOUR: u32 = 4;

/// Default timeout for one registry call in milliseconds (10 seconds)
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS);

/// Minimum spacing between two forced checks of the same container (60 seconds)
pub const DEFAULT_FORCE_GUARD_SECS: u64 = 60;

/// Registry calls allowed in flight at once across all containers
pub const DEFAULT_MAX_CONCURRENT_CHECKS: usize = 4;

/// Delay between starting each check of a batch to avoid rate limiting (10ms)
pub const FETCH_STAGGER_DELAY_MS: u64 = 10;

/// Log file written inside the data directory
pub const LOG_FILE_NAME: &str = "image-update-checker.log";

static CHECK_TIME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([01]?[0-9]|2[0-3]):([0-5]?[0-9])$").expect("valid check time regex")
});

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Check hour must be between 0 and 23, got {0}")]
    InvalidHour(u32),

    #[error("Check minute must be between 0 and 59, got {0}")]
    InvalidMinute(u32),

    #[error("Check time must be in HH:MM format (e.g. 04:30), got {0:?}")]
    InvalidTime(String),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Time of day at which the daily check runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckTime {
    hour: u32,
    minute: u32,
}

impl CheckTime {
    pub fn new(hour: u32, minute: u32) -> Result<Self, ConfigError> {
        if hour > 23 {
            return Err(ConfigError::InvalidHour(hour));
        }
        if minute > 59 {
            return Err(ConfigError::InvalidMinute(minute));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }
}

impl Default for CheckTime {
    fn default() -> Self {
        Self {
            hour: DEFAULT_CHECK_HOUR,
            minute: 0,
        }
    }
}

/// Parses an `HH:MM` string; single-digit hours and minutes are accepted
pub fn parse_check_time(value: &str) -> Result<CheckTime, ConfigError> {
    let captures = CHECK_TIME_PATTERN
        .captures(value.trim())
        .ok_or_else(|| ConfigError::InvalidTime(value.to_string()))?;

    let hour = captures[1]
        .parse()
        .map_err(|_| ConfigError::InvalidTime(value.to_string()))?;
    let minute = captures[2]
        .parse()
        .map_err(|_| ConfigError::InvalidTime(value.to_string()))?;

    CheckTime::new(hour, minute)
}

/// Update check configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdateCheckConfig {
    /// Operator toggle; when off no timer work runs and forced checks are refused
    pub check_enabled: bool,
    pub check_hour: u32,
    pub check_minute: u32,
    /// `HH:MM`, overrides `check_hour` and `check_minute` when set
    pub check_time: Option<String>,
    pub force_guard_secs: u64,
    pub max_concurrent_checks: usize,
    pub fetch_timeout_ms: u64,
    pub registries: RegistriesConfig,
}

impl Default for UpdateCheckConfig {
    fn default() -> Self {
        Self {
            check_enabled: false,
            check_hour: DEFAULT_CHECK_HOUR,
            check_minute: 0,
            check_time: None,
            force_guard_secs: DEFAULT_FORCE_GUARD_SECS,
            max_concurrent_checks: DEFAULT_MAX_CONCURRENT_CHECKS,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            registries: RegistriesConfig::default(),
        }
    }
}

impl UpdateCheckConfig {
    /// Loads and validates a JSON config file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.check_time_of_day().map(|_| ())
    }

    /// Effective time of day for the daily check
    pub fn check_time_of_day(&self) -> Result<CheckTime, ConfigError> {
        match &self.check_time {
            Some(value) => parse_check_time(value),
            None => CheckTime::new(self.check_hour, self.check_minute),
        }
    }

    pub fn force_guard(&self) -> chrono::TimeDelta {
        chrono::TimeDelta::seconds(i64::try_from(self.force_guard_secs).unwrap_or(i64::MAX))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Registry-specific configuration
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistriesConfig {
    pub docker_hub: RegistryConfig,
    pub ghcr: RegistryConfig,
}

/// Individual registry configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryConfig {
    pub enabled: bool,
    /// Overrides the public endpoint (mirrors, tests)
    pub base_url: Option<String>,
    /// Read token; only used by registries that accept one
    pub token: Option<String>,
    /// Registry API endpoint, when separate from `base_url` (Docker Hub)
    pub registry_url: Option<String>,
    /// Token service endpoint, when separate from `base_url` (Docker Hub)
    pub auth_url: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            token: None,
            registry_url: None,
            auth_url: None,
        }
    }
}

/// Returns the path to the data directory for image-update-checker.
/// Uses $XDG_DATA_HOME/image-update-checker if XDG_DATA_HOME is set,
/// otherwise falls back to ~/.local/share/image-update-checker,
/// or ./image-update-checker if neither is available.
pub fn data_dir() -> PathBuf {
    data_dir_with_env(std::env::var("XDG_DATA_HOME").ok(), dirs::home_dir())
}

/// Returns the path to the log file.
pub fn log_path() -> PathBuf {
    data_dir().join(LOG_FILE_NAME)
}

fn data_dir_with_env(xdg_data_home: Option<String>, home_dir: Option<PathBuf>) -> PathBuf {
    let data_dir = xdg_data_home
        .map(PathBuf::from)
        .or_else(|| home_dir.map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));

    data_dir.join("image-update-checker")
}
