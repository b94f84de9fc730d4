//! Registry test utilities

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;

use image_update_checker::config::{CheckTime, UpdateCheckConfig};
use image_update_checker::parser::RegistryKind;
use image_update_checker::update::error::RegistryError;
use image_update_checker::update::registry::{LatestImage, Registry, RegistryQuery};
use image_update_checker::update::{RegistrySet, StatusCache, UpdateScheduler};

/// Canned answer for one repository
#[derive(Debug, Clone)]
pub enum MockResponse {
    Digest(String),
    Unauthorized,
    NotFound,
    RateLimited(Option<u64>),
    ServerError,
}

/// Mock registry for testing
pub struct MockRegistry {
    kind: RegistryKind,
    responses: HashMap<String, MockResponse>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl MockRegistry {
    pub fn new(kind: RegistryKind) -> Self {
        Self {
            kind,
            responses: HashMap::new(),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answer for `repository_path` (e.g. `library/nginx`)
    pub fn with_response(mut self, repository_path: &str, response: MockResponse) -> Self {
        self.responses
            .insert(repository_path.to_string(), response);
        self
    }

    pub fn with_digest(self, repository_path: &str, digest: &str) -> Self {
        self.with_response(repository_path, MockResponse::Digest(digest.to_string()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Counter of fetch calls, readable after the registry is moved
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Highest number of fetch calls seen in flight at once
    pub fn peak_counter(&self) -> Arc<AtomicUsize> {
        self.peak.clone()
    }
}

#[async_trait]
impl Registry for MockRegistry {
    fn kind(&self) -> RegistryKind {
        self.kind
    }

    async fn fetch_latest(&self, query: &RegistryQuery) -> Result<LatestImage, RegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let path = query.repository_path();
        match self.responses.get(&path) {
            Some(MockResponse::Digest(digest)) => Ok(LatestImage::new(
                Some(digest.clone()),
                Some(query.tag.clone()),
            )),
            Some(MockResponse::Unauthorized) => Err(RegistryError::Unauthorized(path)),
            Some(MockResponse::NotFound) | None => Err(RegistryError::NotFound(path)),
            Some(MockResponse::RateLimited(retry_after_secs)) => Err(RegistryError::RateLimited {
                retry_after_secs: *retry_after_secs,
            }),
            Some(MockResponse::ServerError) => {
                Err(RegistryError::InvalidResponse("Unexpected status: 503".to_string()))
            }
        }
    }
}

pub fn enabled_config() -> UpdateCheckConfig {
    UpdateCheckConfig {
        check_enabled: true,
        ..Default::default()
    }
}

/// Create a scheduler over a fresh cache with the given registries
pub fn create_test_scheduler(
    config: UpdateCheckConfig,
    registries: Vec<MockRegistry>,
) -> (Arc<StatusCache>, UpdateScheduler<StatusCache>) {
    let cache = Arc::new(StatusCache::new(
        CheckTime::default(),
        TimeDelta::seconds(60),
    ));
    let registries = registries
        .into_iter()
        .fold(RegistrySet::new(), |set, registry| set.with(Arc::new(registry)));
    let scheduler = UpdateScheduler::new(config, cache.clone(), registries).unwrap();
    (cache, scheduler)
}
