//! Update check scheduling
//!
//! Owns the container inventory and drives checks from three sources: the
//! daily timer, forced requests and explicit batch runs. A check for one
//! container is never run twice at once; later requests attach to the
//! in-flight result.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{CheckTime, ConfigError, FETCH_STAGGER_DELAY_MS, UpdateCheckConfig};
use crate::parser::image_ref::ImageReference;
use crate::parser::types::RegistryKind;
use crate::update::cache::next_check_after;
use crate::update::checker::{CurrentImage, StatusStore, status_from_result};
use crate::update::error::RegistryError;
use crate::update::inventory::{ContainerImage, InventoryChanges};
use crate::update::registry::RegistryQuery;
use crate::update::resolver::RegistrySet;
use crate::update::status::{UpdateStatus, UpdateStatusCode};

type SharedCheck = Shared<BoxFuture<'static, UpdateStatus>>;

/// Schedules and runs update checks for a set of containers
pub struct UpdateScheduler<S: StatusStore> {
    inner: Arc<Inner<S>>,
}

impl<S: StatusStore> Clone for UpdateScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<S: StatusStore> {
    config: UpdateCheckConfig,
    check_time: CheckTime,
    store: Arc<S>,
    registries: RegistrySet,
    containers: RwLock<HashMap<String, ContainerImage>>,
    in_flight: Mutex<HashMap<String, SharedCheck>>,
    permits: Semaphore,
    /// Registry kinds paused after a rate limit, with the time they resume
    backoff: Mutex<HashMap<RegistryKind, Instant>>,
    cancel: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<S: StatusStore> UpdateScheduler<S> {
    pub fn new(
        config: UpdateCheckConfig,
        store: Arc<S>,
        registries: RegistrySet,
    ) -> Result<Self, ConfigError> {
        let check_time = config.check_time_of_day()?;
        let permits = Semaphore::new(config.max_concurrent_checks.max(1));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                check_time,
                store,
                registries,
                containers: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                permits,
                backoff: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                timer: Mutex::new(None),
            }),
        })
    }

    pub fn is_checking_enabled(&self) -> bool {
        self.inner.config.check_enabled
    }

    /// Start the daily timer
    ///
    /// Does nothing when checking is disabled or the timer already runs.
    pub fn start(&self) {
        if !self.is_checking_enabled() {
            info!("Update checking disabled, timer not started");
            return;
        }

        let mut timer = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if timer.is_some() {
            debug!("Update check timer already running");
            return;
        }

        let scheduler = self.clone();
        *timer = Some(tokio::spawn(async move {
            scheduler.run_timer().await;
        }));
    }

    /// Stop the timer and cancel in-flight checks
    ///
    /// Cancelled checks leave the cache untouched. A stopped scheduler
    /// cannot be restarted.
    pub async fn stop(&self) {
        info!("Stopping update scheduler");
        self.inner.cancel.cancel();

        let timer = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = timer {
            let _ = handle
                .await
                .inspect_err(|e| error!("Update check timer failed: {}", e));
        }
    }

    async fn run_timer(&self) {
        loop {
            let now = Local::now();
            let next = next_check_after(&now, self.inner.check_time);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!("Next update check at {}", next);

            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => {
                    debug!("Update check timer cancelled");
                    return;
                }
                _ = sleep(wait) => {}
            }

            info!("Scheduled update check time reached");
            let checked = self.run_due_checks(Utc::now()).await;
            info!("Scheduled update check finished, {} containers checked", checked);
        }
    }

    /// Replace the known inventory
    ///
    /// Vanished containers are dropped from the cache; containers whose
    /// image changed become due on the next cycle.
    pub fn sync_inventory(&self, items: Vec<ContainerImage>) -> InventoryChanges {
        let incoming: HashMap<String, ContainerImage> = items
            .into_iter()
            .map(|item| (item.container_id.clone(), item))
            .collect();

        let mut containers = self
            .inner
            .containers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut changes = InventoryChanges::default();

        for id in containers.keys() {
            if !incoming.contains_key(id) {
                changes.removed.push(id.clone());
            }
        }

        for (id, item) in &incoming {
            match containers.get(id) {
                None => changes.added.push(id.clone()),
                Some(existing) if existing != item => changes.image_changed.push(id.clone()),
                Some(_) => {}
            }
        }

        for id in &changes.removed {
            let _ = self
                .inner
                .store
                .remove(id)
                .inspect_err(|e| error!("Failed to remove status for {}: {}", id, e));
        }
        for id in &changes.image_changed {
            let _ = self
                .inner
                .store
                .invalidate(id)
                .inspect_err(|e| error!("Failed to invalidate status for {}: {}", id, e));
        }

        *containers = incoming;

        changes.added.sort();
        changes.removed.sort();
        changes.image_changed.sort();

        if !changes.is_empty() {
            info!(
                "Inventory synced: {} added, {} removed, {} changed",
                changes.added.len(),
                changes.removed.len(),
                changes.image_changed.len()
            );
        }

        changes
    }

    pub fn container_ids(&self) -> Vec<String> {
        let containers = self
            .inner
            .containers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Last known status of a container
    pub fn status(&self, container_id: &str) -> UpdateStatus {
        self.inner.current_status(container_id)
    }

    /// Last known status of every container in the inventory
    pub fn statuses(&self) -> BTreeMap<String, UpdateStatus> {
        self.container_ids()
            .into_iter()
            .map(|id| {
                let status = self.status(&id);
                (id, status)
            })
            .collect()
    }

    /// Check every due container
    ///
    /// Checks start staggered and run concurrently up to the configured
    /// limit. Returns the number of containers checked.
    pub async fn run_due_checks(&self, now: DateTime<Utc>) -> usize {
        if !self.is_checking_enabled() {
            return 0;
        }

        let due: Vec<ContainerImage> = {
            let containers = self
                .inner
                .containers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            containers
                .values()
                .filter(|container| {
                    self.inner
                        .store
                        .is_due(&container.container_id, now)
                        .inspect_err(|e| {
                            error!("Failed to read due state for {}: {}", container.container_id, e)
                        })
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };

        if due.is_empty() {
            debug!("No containers due for an update check");
            return 0;
        }

        info!("{} containers due for an update check", due.len());
        let count = due.len();

        let futures = due.into_iter().enumerate().map(|(i, container)| {
            let delay = Duration::from_millis(FETCH_STAGGER_DELAY_MS * i as u64);
            async move {
                sleep(delay).await;
                match self.inner.check_or_attach(container, false) {
                    Ok(check) => {
                        check.await;
                    }
                    Err(status) => debug!("Due check not started: {}", status.description),
                }
            }
        });

        join_all(futures).await;
        count
    }

    /// Check one container now, bypassing the daily schedule
    ///
    /// A request arriving while that container is already being checked
    /// gets the in-flight result. Otherwise a request within the guard
    /// interval of the previous forced check is refused with a RateLimited
    /// status that is not stored. Returns NotChecked when checking is
    /// disabled or the container is unknown.
    pub async fn request_forced_check(&self, container_id: &str) -> UpdateStatus {
        if !self.is_checking_enabled() {
            debug!("Forced check of {} ignored, checking disabled", container_id);
            return UpdateStatus::not_checked();
        }

        let container = {
            let containers = self
                .inner
                .containers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            containers.get(container_id).cloned()
        };
        let Some(container) = container else {
            warn!("Forced check requested for unknown container {}", container_id);
            return UpdateStatus::not_checked();
        };

        match self.inner.check_or_attach(container, true) {
            Ok(check) => check.await,
            Err(status) => status,
        }
    }

    /// Force a check of every container in the inventory
    pub async fn request_forced_check_all(&self) -> BTreeMap<String, UpdateStatus> {
        let ids = self.container_ids();

        let futures = ids.into_iter().enumerate().map(|(i, id)| {
            let delay = Duration::from_millis(FETCH_STAGGER_DELAY_MS * i as u64);
            async move {
                sleep(delay).await;
                let status = self.request_forced_check(&id).await;
                (id, status)
            }
        });

        join_all(futures).await.into_iter().collect()
    }
}

impl<S: StatusStore> Inner<S> {
    fn current_status(&self, container_id: &str) -> UpdateStatus {
        self.store
            .get(container_id)
            .inspect_err(|e| error!("Failed to read status for {}: {}", container_id, e))
            .unwrap_or_default()
    }

    /// Attach to the running check of a container or start a new one
    ///
    /// `Err` carries the status to report when no check is started.
    fn check_or_attach(
        self: &Arc<Self>,
        container: ContainerImage,
        forced: bool,
    ) -> Result<SharedCheck, UpdateStatus> {
        let id = container.container_id.clone();

        if self.cancel.is_cancelled() {
            debug!("Scheduler stopped, not checking {}", id);
            return Err(self.current_status(&id));
        }

        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(check) = in_flight.get(&id) {
            debug!("Check of {} already in flight, attaching", id);
            return Ok(check.clone());
        }

        if forced {
            match self.store.mark_forced(&id, Utc::now()) {
                Ok(true) => {}
                Ok(false) => {
                    info!("Forced check of {} refused, too soon after the last one", id);
                    return Err(UpdateStatus::new(UpdateStatusCode::RateLimited));
                }
                Err(e) => {
                    error!("Failed to record forced check for {}: {}", id, e);
                    return Err(UpdateStatus::new(UpdateStatusCode::RegistryError));
                }
            }
        }

        let inner = self.clone();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let status = inner.run_check(&container).await;
            inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&task_id);
            status
        });

        let check = async move {
            handle.await.unwrap_or_else(|e| {
                error!("Update check task failed: {}", e);
                UpdateStatus::new(UpdateStatusCode::RegistryError)
            })
        }
        .boxed()
        .shared();

        in_flight.insert(id, check.clone());
        Ok(check)
    }

    async fn run_check(&self, container: &ContainerImage) -> UpdateStatus {
        let id = &container.container_id;
        let reference = ImageReference::parse(&container.image);

        if reference.is_degraded() {
            warn!(
                "Unusable image reference {:?} for {}, not contacting a registry",
                container.image, id
            );
            return self.store_status(id, UpdateStatus::new(UpdateStatusCode::RegistryError));
        }

        let (kind, registry) = match self.registries.for_host(reference.registry_host()) {
            Ok(found) => found,
            Err(e) => {
                warn!("Cannot check {} ({}): {}", id, reference, e);
                return self.store_status(id, UpdateStatus::new(e.status_code()));
            }
        };

        if let Some(resume_at) = self.backoff_until(kind) {
            info!(
                "{} rate limited for another {}s, skipping {}",
                kind,
                resume_at.saturating_duration_since(Instant::now()).as_secs(),
                id
            );
            return self.store_status(id, UpdateStatus::new(UpdateStatusCode::RateLimited));
        }

        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return self.cancelled(id),
            permit = self.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return self.cancelled(id),
            },
        };

        let current = CurrentImage {
            digest: container
                .image_digest
                .as_deref()
                .or_else(|| reference.digest()),
            image_id: container.image_id.as_deref(),
            tag: reference.tag(),
        };

        // Without a repo digest only the platform image's config digest can
        // be matched against the local image id
        let platform = (current.digest.is_none() && current.image_id.is_some())
            .then(|| container.platform());
        let query = RegistryQuery::from(&reference).with_platform(platform);
        debug!("Checking {} ({}) on {}", id, reference, kind);

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return self.cancelled(id),
            result = timeout(self.config.fetch_timeout(), registry.fetch_latest(&query)) => {
                result.unwrap_or_else(|_| Err(RegistryError::Timeout))
            }
        };

        match &result {
            Ok(latest) => debug!("{} resolved to {:?}", reference, latest.digest),
            Err(e) => {
                warn!("Check of {} failed: {}", id, e);
                if let RegistryError::RateLimited {
                    retry_after_secs: Some(secs),
                } = e
                {
                    self.pause(kind, Duration::from_secs(*secs));
                }
            }
        }

        let status = status_from_result(&current, &result);

        self.store_status(id, status)
    }

    fn cancelled(&self, container_id: &str) -> UpdateStatus {
        info!("Check of {} cancelled", container_id);
        self.current_status(container_id)
    }

    fn is_known(&self, container_id: &str) -> bool {
        self.containers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(container_id)
    }

    /// Store a result unless the container left the inventory meanwhile
    ///
    /// A sync may remove the container while the write is under way, so
    /// membership is checked again afterwards and a stale entry dropped.
    fn store_status(&self, container_id: &str, status: UpdateStatus) -> UpdateStatus {
        if !self.is_known(container_id) {
            debug!("{} left the inventory, discarding its result", container_id);
            return status;
        }

        info!(
            "Update status for {}: {} ({})",
            container_id,
            status.code.code(),
            status.description
        );

        let stored = self
            .store
            .put(container_id, status.clone(), Utc::now())
            .inspect_err(|e| error!("Failed to store status for {}: {}", container_id, e))
            .unwrap_or(status);

        if !self.is_known(container_id) {
            debug!("{} left the inventory while its result was stored", container_id);
            let _ = self
                .store
                .remove(container_id)
                .inspect_err(|e| error!("Failed to remove status for {}: {}", container_id, e));
        }

        stored
    }

    fn backoff_until(&self, kind: RegistryKind) -> Option<Instant> {
        let mut backoff = self.backoff.lock().unwrap_or_else(PoisonError::into_inner);
        match backoff.get(&kind) {
            Some(resume_at) if *resume_at > Instant::now() => Some(*resume_at),
            Some(_) => {
                debug!("{} rate limit pause over", kind);
                backoff.remove(&kind);
                None
            }
            None => None,
        }
    }

    fn pause(&self, kind: RegistryKind, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        info!("Pausing {} checks for {}s", kind, duration.as_secs());
        self.backoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, Instant::now() + duration);
    }
}
