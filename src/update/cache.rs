use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Days, Local, NaiveTime, TimeDelta, TimeZone, Utc};
use tracing::debug;

use crate::config::CheckTime;
use crate::update::checker::StatusStore;
use crate::update::error::CacheError;
use crate::update::status::UpdateStatus;

#[derive(Debug, Clone, Default)]
struct CacheEntry {
    status: UpdateStatus,
    /// None until the first put, or after an invalidation
    next_eligible_check_at: Option<DateTime<Utc>>,
    last_forced_at: Option<DateTime<Utc>>,
}

/// In-memory update status per container
///
/// Entries live as long as the container is in the inventory; nothing is
/// persisted across restarts.
pub struct StatusCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    check_time: CheckTime,
    force_guard: TimeDelta,
}

impl StatusCache {
    pub fn new(check_time: CheckTime, force_guard: TimeDelta) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            check_time,
            force_guard,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, CacheEntry>>, CacheError> {
        self.entries.read().map_err(|_| CacheError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, CacheEntry>>, CacheError> {
        self.entries.write().map_err(|_| CacheError::LockPoisoned)
    }

    /// Next occurrence of the check time (local wall clock) strictly after `now`
    pub fn next_eligible_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        next_check_after(&now.with_timezone(&Local), self.check_time).with_timezone(&Utc)
    }

    pub fn next_eligible_check_at(
        &self,
        container_id: &str,
    ) -> Result<Option<DateTime<Utc>>, CacheError> {
        let entries = self.read()?;
        Ok(entries
            .get(container_id)
            .and_then(|entry| entry.next_eligible_check_at))
    }

    pub fn len(&self) -> usize {
        self.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Next instant at which the wall clock of `now`'s zone reads `check_time`,
/// strictly after `now`
///
/// A check time that falls in a DST gap moves one hour later that day.
pub fn next_check_after<Tz: TimeZone>(now: &DateTime<Tz>, check_time: CheckTime) -> DateTime<Tz> {
    let timezone = now.timezone();
    let time = NaiveTime::from_hms_opt(check_time.hour(), check_time.minute(), 0)
        .unwrap_or(NaiveTime::MIN);
    let today = now.date_naive();

    for offset in 0..=2 {
        let Some(date) = today.checked_add_days(Days::new(offset)) else {
            break;
        };
        let local = date.and_time(time);
        let candidate = timezone
            .from_local_datetime(&local)
            .earliest()
            .or_else(|| {
                timezone
                    .from_local_datetime(&(local + TimeDelta::hours(1)))
                    .earliest()
            });

        if let Some(candidate) = candidate
            && candidate > *now
        {
            return candidate;
        }
    }

    now.clone() + TimeDelta::days(1)
}

impl StatusStore for StatusCache {
    fn get(&self, container_id: &str) -> Result<UpdateStatus, CacheError> {
        let entries = self.read()?;
        Ok(entries
            .get(container_id)
            .map(|entry| entry.status.clone())
            .unwrap_or_default())
    }

    fn put(
        &self,
        container_id: &str,
        mut status: UpdateStatus,
        now: DateTime<Utc>,
    ) -> Result<UpdateStatus, CacheError> {
        status.checked_at = Some(now);
        let next = self.next_eligible_after(now);

        let mut entries = self.write()?;
        let entry = entries.entry(container_id.to_string()).or_default();
        entry.status = status.clone();
        entry.next_eligible_check_at = Some(next);

        debug!(
            "Stored status {} for {} (next check at {})",
            status.code.code(),
            container_id,
            next
        );

        Ok(status)
    }

    fn is_due(&self, container_id: &str, now: DateTime<Utc>) -> Result<bool, CacheError> {
        let entries = self.read()?;
        Ok(entries
            .get(container_id)
            .and_then(|entry| entry.next_eligible_check_at)
            .is_none_or(|next| now >= next))
    }

    fn mark_forced(&self, container_id: &str, now: DateTime<Utc>) -> Result<bool, CacheError> {
        let mut entries = self.write()?;
        let entry = entries.entry(container_id.to_string()).or_default();

        if let Some(last) = entry.last_forced_at
            && now - last < self.force_guard
        {
            return Ok(false);
        }

        entry.last_forced_at = Some(now);
        Ok(true)
    }

    fn invalidate(&self, container_id: &str) -> Result<(), CacheError> {
        let mut entries = self.write()?;
        if let Some(entry) = entries.get_mut(container_id) {
            entry.next_eligible_check_at = None;
        }
        Ok(())
    }

    fn remove(&self, container_id: &str) -> Result<(), CacheError> {
        let mut entries = self.write()?;
        entries.remove(container_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::status::UpdateStatusCode;
    use rstest::rstest;

    fn cache() -> StatusCache {
        StatusCache::new(CheckTime::default(), TimeDelta::seconds(60))
    }

    fn at(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn get_returns_not_checked_for_unknown_container() {
        let cache = cache();

        assert_eq!(cache.get("abc").unwrap(), UpdateStatus::not_checked());
    }

    #[test]
    fn get_after_put_returns_stored_status() {
        let cache = cache();
        let now = at("2024-06-01T12:00:00Z");
        let status = UpdateStatus::with_latest(
            UpdateStatusCode::UpdateAvailable,
            Some("sha256:bbb".to_string()),
            Some("1.25".to_string()),
        );

        let stored = cache.put("abc", status.clone(), now).unwrap();

        assert_eq!(stored.checked_at, Some(now));
        assert_eq!(cache.get("abc").unwrap(), stored);
        assert_eq!(stored.latest_digest, status.latest_digest);
    }

    #[test]
    fn put_replaces_previous_status() {
        let cache = cache();
        let now = at("2024-06-01T12:00:00Z");

        cache
            .put("abc", UpdateStatus::new(UpdateStatusCode::UpdateAvailable), now)
            .unwrap();
        cache
            .put("abc", UpdateStatus::new(UpdateStatusCode::UpToDate), now)
            .unwrap();

        assert_eq!(cache.get("abc").unwrap().code, UpdateStatusCode::UpToDate);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn is_due_true_for_unknown_container() {
        let cache = cache();

        assert!(cache.is_due("abc", Utc::now()).unwrap());
    }

    #[test]
    fn is_due_false_after_put_until_next_eligible_time() {
        let cache = cache();
        let now = at("2024-06-01T12:00:00Z");

        cache
            .put("abc", UpdateStatus::new(UpdateStatusCode::UpToDate), now)
            .unwrap();
        let next = cache.next_eligible_check_at("abc").unwrap().unwrap();

        assert!(next > now);
        assert!(next <= now + TimeDelta::days(1) + TimeDelta::hours(1));
        assert!(!cache.is_due("abc", now).unwrap());
        assert!(!cache.is_due("abc", next - TimeDelta::seconds(1)).unwrap());
        assert!(cache.is_due("abc", next).unwrap());
    }

    #[test]
    fn invalidate_makes_container_due_and_keeps_status() {
        let cache = cache();
        let now = at("2024-06-01T12:00:00Z");
        cache
            .put("abc", UpdateStatus::new(UpdateStatusCode::UpToDate), now)
            .unwrap();

        cache.invalidate("abc").unwrap();

        assert!(cache.is_due("abc", now).unwrap());
        assert_eq!(cache.get("abc").unwrap().code, UpdateStatusCode::UpToDate);
    }

    #[test]
    fn remove_drops_entry() {
        let cache = cache();
        let now = at("2024-06-01T12:00:00Z");
        cache
            .put("abc", UpdateStatus::new(UpdateStatusCode::UpToDate), now)
            .unwrap();

        cache.remove("abc").unwrap();

        assert_eq!(cache.get("abc").unwrap(), UpdateStatus::not_checked());
        assert!(cache.is_empty());
    }

    #[test]
    fn mark_forced_refuses_within_guard_interval() {
        let cache = cache();
        let now = at("2024-06-01T12:00:00Z");

        assert!(cache.mark_forced("abc", now).unwrap());
        assert!(!cache.mark_forced("abc", now + TimeDelta::seconds(59)).unwrap());
        assert!(cache.mark_forced("abc", now + TimeDelta::seconds(60)).unwrap());
    }

    #[test]
    fn mark_forced_refusal_does_not_extend_guard() {
        let cache = cache();
        let now = at("2024-06-01T12:00:00Z");

        assert!(cache.mark_forced("abc", now).unwrap());
        assert!(!cache.mark_forced("abc", now + TimeDelta::seconds(30)).unwrap());
        assert!(cache.mark_forced("abc", now + TimeDelta::seconds(61)).unwrap());
    }

    #[test]
    fn mark_forced_is_independent_of_next_eligible_time() {
        let cache = cache();
        let now = at("2024-06-01T12:00:00Z");
        cache
            .put("abc", UpdateStatus::new(UpdateStatusCode::UpToDate), now)
            .unwrap();

        assert!(cache.mark_forced("abc", now).unwrap());
        assert!(!cache.is_due("abc", now).unwrap());
    }

    #[test]
    fn operations_do_not_affect_other_containers() {
        let cache = cache();
        let now = at("2024-06-01T12:00:00Z");
        cache
            .put("a", UpdateStatus::new(UpdateStatusCode::UpdateAvailable), now)
            .unwrap();
        cache
            .put("b", UpdateStatus::new(UpdateStatusCode::UpToDate), now)
            .unwrap();

        cache.mark_forced("a", now).unwrap();
        cache.invalidate("a").unwrap();
        cache.remove("a").unwrap();

        assert_eq!(cache.get("b").unwrap().code, UpdateStatusCode::UpToDate);
        assert!(!cache.is_due("b", now).unwrap());
        assert!(cache.mark_forced("b", now).unwrap());
    }

    #[rstest]
    #[case("2024-06-01T03:00:00Z", 4, 0, "2024-06-01T04:00:00Z")]
    #[case("2024-06-01T04:00:00Z", 4, 0, "2024-06-02T04:00:00Z")]
    #[case("2024-06-01T12:00:00Z", 4, 0, "2024-06-02T04:00:00Z")]
    #[case("2024-06-01T23:59:00Z", 0, 0, "2024-06-02T00:00:00Z")]
    #[case("2024-12-31T22:00:00Z", 22, 30, "2024-12-31T22:30:00Z")]
    #[case("2024-12-31T23:00:00Z", 22, 30, "2025-01-01T22:30:00Z")]
    fn next_check_after_returns_next_occurrence(
        #[case] now: &str,
        #[case] hour: u32,
        #[case] minute: u32,
        #[case] expected: &str,
    ) {
        let check_time = CheckTime::new(hour, minute).unwrap();

        let result = next_check_after(&at(now), check_time);

        assert_eq!(result, at(expected));
    }
}
