//! Destination table cache for materialized views.
//!
//! Keys are materialization SQL statements; values describe the temporary
//! table holding that statement's result. Entries expire a fixed time after
//! they were written and the cache holds at most `max_entries` of them.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bqlink_core::{Result, TableInfo};
use chrono::{DateTime, TimeDelta, Utc};
use moka::future::Cache;
use tracing::debug;

pub const DEFAULT_MAX_ENTRIES: usize = 1000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

// ===========================================================================
// Clocks
// ===========================================================================

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(next) = TimeDelta::from_std(by)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
        {
            *now = next;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ===========================================================================
// Cache
// ===========================================================================

#[derive(Debug, Clone)]
struct Entry {
    value: TableInfo,
    written_at: DateTime<Utc>,
}

/// Size-bounded, expiring map from materialization SQL to destination table.
///
/// Entries expire `ttl` after they were written, measured on the injected
/// [`Clock`]. The underlying cache also expires them on wall time.
pub struct DestinationTableCache {
    entries: Cache<String, Entry>,
    max_entries: usize,
    ttl: TimeDelta,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for DestinationTableCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationTableCache")
            .field("max_entries", &self.max_entries)
            .field("ttl", &self.ttl)
            .field("entry_count", &self.entries.entry_count())
            .finish()
    }
}

impl Default for DestinationTableCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_TTL, Arc::new(SystemClock))
    }
}

impl DestinationTableCache {
    pub fn new(max_entries: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let max_entries = max_entries.max(1);
        let entries = Cache::builder()
            .max_capacity(max_entries as u64)
            .time_to_live(ttl)
            .eviction_listener(|_, entry: Entry, cause| {
                if cause.was_evicted() {
                    debug!(
                        "Evicted destination table cache entry: table='{}', cause={:?}",
                        entry.value.reference, cause
                    );
                }
            })
            .build();
        Self {
            entries,
            max_entries,
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            clock,
        }
    }

    fn is_expired(&self, entry: &Entry) -> bool {
        entry
            .written_at
            .checked_add_signed(self.ttl)
            .is_some_and(|expires_at| self.clock.now() >= expires_at)
    }

    /// Return the live value for `key`, computing it with `init` if absent or
    /// expired.
    ///
    /// Concurrent callers for the same key share one computation and its
    /// outcome. A failed computation is not stored, so the next caller tries
    /// again.
    pub async fn get_or_try_insert_with<F, Fut>(&self, key: &str, init: F) -> Result<TableInfo>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TableInfo>>,
    {
        if let Some(entry) = self.entries.get(key).await {
            if !self.is_expired(&entry) {
                debug!("Destination table cache hit: table='{}'", entry.value.reference);
                return Ok(entry.value);
            }
            debug!("Destination table cache entry expired: table='{}'", entry.value.reference);
            self.entries.invalidate(key).await;
        }

        let clock = Arc::clone(&self.clock);
        self.entries
            .try_get_with(key.to_string(), async move {
                debug!("Destination table cache miss, computing entry");
                let value = init().await?;
                Ok(Entry {
                    value,
                    written_at: clock.now(),
                })
            })
            .await
            .map(|entry| entry.value)
            .map_err(Arc::unwrap_or_clone)
    }

    /// Live value for `key`, if any.
    pub async fn get(&self, key: &str) -> Option<TableInfo> {
        self.entries
            .get(key)
            .await
            .filter(|entry| !self.is_expired(entry))
            .map(|entry| entry.value)
    }

    pub async fn invalidate(&self, key: &str) {
        self.entries.invalidate(key).await;
    }

    /// Number of stored entries once pending evictions have been applied.
    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
