//! Time-to-live cache shared by the [`RefreshLoop`](crate::refresh::RefreshLoop) and the
//! request read path.
//!
//! Entries are only ever replaced whole. A read that finds an entry younger than the
//! configured ttl is a hit; anything else is a miss and the caller decides whether to
//! refresh.

use crate::{
    clock::{Clock, SystemClock},
    model::CoinId,
};
use chrono::{DateTime, TimeDelta, Utc};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use std::{sync::Arc, time::Duration};

/// Default cache time-to-live (5 minutes).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Keys under which market data is cached, derived from the shape of the request.
#[derive(Debug)]
pub struct CacheKey;

impl CacheKey {
    pub fn market_overview() -> String {
        "market_overview".to_string()
    }

    pub fn coin_history(coin: &CoinId, days: u32) -> String {
        format!("coin_history_{coin}_{days}")
    }
}

/// Cached value and the time it was stored.
#[derive(Clone, PartialEq, Debug)]
pub struct CacheEntry<V> {
    pub value: V,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Cache<V> {
    entries: RwLock<FnvHashMap<String, CacheEntry<V>>>,
    ttl: TimeDelta,
    clock: Arc<dyn Clock>,
}

impl<V> Cache<V>
where
    V: Clone,
{
    /// Construct a [`Cache`] that stamps entries using the system clock.
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(FnvHashMap::default()),
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            clock,
        }
    }

    /// Return the cached value if it is younger than the ttl, otherwise `None` (a miss).
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        self.entries
            .read()
            .get(key)
            .filter(|entry| now.signed_duration_since(entry.fetched_at) < self.ttl)
            .map(|entry| entry.value.clone())
    }

    /// Return the last stored entry regardless of age.
    pub fn peek(&self, key: &str) -> Option<CacheEntry<V>> {
        self.entries.read().get(key).cloned()
    }

    /// Replace the entry for `key`, stamping it with the current time.
    pub fn put(&self, key: impl Into<String>, value: V) {
        let entry = CacheEntry {
            value,
            fetched_at: self.clock.now(),
        };
        self.entries.write().insert(key.into(), entry);
    }

    /// Force the next [`Cache::get`] for `key` to miss.
    pub fn invalidate(&self, key: &str) {
        self.entries.write().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }
}
