//! Storage for per-client quota records.
//!
//! The limiter only talks to a [`QuotaStore`] through read and
//! compare-and-swap, so a process-local map and a shared Redis instance
//! are interchangeable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::Result;

/// Request count for one client in its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientQuotaRecord {
    pub count: u32,
    pub window_reset_at: DateTime<Utc>,
}

impl ClientQuotaRecord {
    pub fn new(count: u32, window_reset_at: DateTime<Utc>) -> Self {
        Self {
            count,
            window_reset_at,
        }
    }

    /// A window is over once `now` reaches its reset time.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_reset_at
    }
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Current record for `identity`, if one exists.
    async fn get(&self, identity: &str) -> Result<Option<ClientQuotaRecord>>;

    /// Store `new` only if the stored record still equals `expected`
    /// (`None` meaning no record). Returns whether the write happened.
    /// `now` is the caller's clock reading for the evaluation.
    async fn compare_and_swap(
        &self,
        identity: &str,
        expected: Option<&ClientQuotaRecord>,
        new: ClientQuotaRecord,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Remove records whose window ended at or before `now`.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize>;

    async fn ping(&self) -> Result<()>;

    fn backend(&self) -> &'static str;
}

/// In-process store. Each identity lives in one DashMap shard, so a
/// compare-and-swap only locks that shard.
pub struct MemoryQuotaStore {
    records: DashMap<String, ClientQuotaRecord>,
    max_tracked_clients: usize,
}

impl MemoryQuotaStore {
    pub fn new(max_tracked_clients: usize) -> Self {
        Self {
            records: DashMap::new(),
            max_tracked_clients,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        before.saturating_sub(self.records.len())
    }

    fn make_room(&self, now: DateTime<Utc>) {
        if self.records.len() < self.max_tracked_clients {
            return;
        }
        let removed = self.sweep_expired(now);
        debug!(removed, "Swept expired quota records at capacity");
        if self.records.len() >= self.max_tracked_clients {
            warn!(
                tracked = self.records.len(),
                capacity = self.max_tracked_clients,
                "Quota store over capacity with only live windows"
            );
        }
    }
}

impl Default for MemoryQuotaStore {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn get(&self, identity: &str) -> Result<Option<ClientQuotaRecord>> {
        Ok(self.records.get(identity).map(|record| *record))
    }

    async fn compare_and_swap(
        &self,
        identity: &str,
        expected: Option<&ClientQuotaRecord>,
        new: ClientQuotaRecord,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if expected.is_none() && !self.records.contains_key(identity) {
            // Sweeping takes every shard lock, so it must run before we hold one.
            self.make_room(now);
        }

        match self.records.entry(identity.to_string()) {
            Entry::Occupied(mut entry) => {
                if expected == Some(entry.get()) {
                    entry.insert(new);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(entry) => {
                if expected.is_none() {
                    entry.insert(new);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        Ok(self.sweep_expired(now))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const NOW: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[tokio::test]
    async fn test_insert_requires_absent_record() {
        let store = MemoryQuotaStore::default();
        let first = ClientQuotaRecord::new(1, at(60_000));

        assert!(store.compare_and_swap("ip:1.2.3.4", None, first, NOW).await.unwrap());
        assert!(!store.compare_and_swap("ip:1.2.3.4", None, first, NOW).await.unwrap());
        assert_eq!(store.get("ip:1.2.3.4").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_stale_expectation_is_rejected() {
        let store = MemoryQuotaStore::default();
        let first = ClientQuotaRecord::new(1, at(60_000));
        let second = ClientQuotaRecord::new(2, at(60_000));
        store.compare_and_swap("key:ABC", None, first, NOW).await.unwrap();
        store.compare_and_swap("key:ABC", Some(&first), second, NOW).await.unwrap();

        let third = ClientQuotaRecord::new(2, at(60_000));
        assert!(!store.compare_and_swap("key:ABC", Some(&first), third, NOW).await.unwrap());
        assert_eq!(store.get("key:ABC").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_sweep_drops_only_expired_windows() {
        let store = MemoryQuotaStore::default();
        let now = at(100_000);
        store
            .compare_and_swap("ip:old", None, ClientQuotaRecord::new(30, now - Duration::seconds(1)), now)
            .await
            .unwrap();
        store
            .compare_and_swap("ip:edge", None, ClientQuotaRecord::new(3, now), now)
            .await
            .unwrap();
        store
            .compare_and_swap("ip:live", None, ClientQuotaRecord::new(3, now + Duration::seconds(30)), now)
            .await
            .unwrap();

        assert_eq!(store.sweep(now).await.unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert!(store.get("ip:live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_capacity_sweeps_expired_records_before_insert() {
        let store = MemoryQuotaStore::new(1);
        let long_gone = ClientQuotaRecord::new(1, at(1_000));
        store.compare_and_swap("ip:a", None, long_gone, NOW).await.unwrap();

        let now = at(2_000);
        let fresh = ClientQuotaRecord::new(1, now + Duration::seconds(60));
        assert!(store.compare_and_swap("ip:b", None, fresh, now).await.unwrap());
        assert_eq!(store.len(), 1);
        assert!(store.get("ip:a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_capacity_sweep_follows_callers_clock() {
        let store = MemoryQuotaStore::new(1);
        let live = ClientQuotaRecord::new(1, at(60_000));
        store.compare_and_swap("ip:a", None, live, NOW).await.unwrap();

        // Long expired by the wall clock, still live at 30s.
        let now = at(30_000);
        let other = ClientQuotaRecord::new(1, now + Duration::seconds(60));
        assert!(store.compare_and_swap("ip:b", None, other, now).await.unwrap());
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("ip:a").await.unwrap(), Some(live));
    }
}
