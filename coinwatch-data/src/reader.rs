//! Cached read path used by request handlers.
//!
//! A fresh cache entry is returned as-is. On a miss a single upstream fetch per key is started
//! and every concurrent caller for that key awaits its result. A successful fetch replaces the
//! cache entry. If it fails the last stored value is served regardless of age, and only when
//! nothing was ever stored is the error surfaced.

use crate::{
    cache::{Cache, CacheKey},
    error::DataError,
    model::{CoinHistory, CoinId, MarketSnapshot, TrendingCoin},
    refresh::SnapshotCache,
    registry::ConnectionRegistry,
    source::MarketDataSource,
};
use fnv::FnvHashMap;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, warn};

/// History window used when a request does not name one.
pub const DEFAULT_HISTORY_DAYS: u32 = 7;

/// Largest history window served.
pub const MAX_HISTORY_DAYS: u32 = 365;

/// [`Cache`] holding per-coin [`CoinHistory`].
pub type HistoryCache = Cache<Arc<CoinHistory>>;

pub struct MarketReader {
    source: Arc<dyn MarketDataSource>,
    overview: ReadThrough<MarketSnapshot>,
    history: ReadThrough<CoinHistory>,
    default_coins: BTreeSet<CoinId>,
    registry: Option<Arc<ConnectionRegistry>>,
}

impl std::fmt::Debug for MarketReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketReader")
            .field("overview_entries", &self.overview.cache.len())
            .field("history_entries", &self.history.cache.len())
            .field("default_coins", &self.default_coins)
            .finish_non_exhaustive()
    }
}

impl MarketReader {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        overview: Arc<SnapshotCache>,
        history: Arc<HistoryCache>,
        default_coins: BTreeSet<CoinId>,
    ) -> Self {
        Self {
            source,
            overview: ReadThrough::new(overview),
            history: ReadThrough::new(history),
            default_coins,
            registry: None,
        }
    }

    /// Include every coin subscribed in `registry` when the overview is fetched on a miss, so
    /// the entry shared with the refresh loop keeps covering live subscriptions.
    pub fn with_registry(self, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry: Some(registry),
            ..self
        }
    }

    /// Coins requested on an overview miss: the defaults plus any live subscriptions.
    pub fn requested_coins(&self) -> BTreeSet<CoinId> {
        let mut coins = self
            .registry
            .as_ref()
            .map(|registry| registry.subscribed_coins())
            .unwrap_or_default();
        coins.extend(self.default_coins.iter().cloned());
        coins
    }

    pub async fn market_overview(&self) -> Result<Arc<MarketSnapshot>, DataError> {
        self.overview
            .get(CacheKey::market_overview(), || {
                let source = Arc::clone(&self.source);
                let coins = self.requested_coins();
                async move { source.fetch_market_snapshot(&coins).await }.boxed()
            })
            .await
    }

    pub async fn trending(&self) -> Result<Vec<TrendingCoin>, DataError> {
        self.market_overview()
            .await
            .map(|snapshot| snapshot.trending.clone())
    }

    /// Price history for `coin`, with `days` clamped to `1..=MAX_HISTORY_DAYS`.
    pub async fn coin_history(
        &self,
        coin: &CoinId,
        days: u32,
    ) -> Result<Arc<CoinHistory>, DataError> {
        let days = days.clamp(1, MAX_HISTORY_DAYS);
        self.history
            .get(CacheKey::coin_history(coin, days), || {
                let source = Arc::clone(&self.source);
                let coin = coin.clone();
                async move { source.fetch_coin_history(&coin, days).await }.boxed()
            })
            .await
    }
}

type Flight<V> = Shared<BoxFuture<'static, Result<Arc<V>, DataError>>>;

/// [`Cache`] front allowing at most one upstream fetch in flight per key.
struct ReadThrough<V> {
    cache: Arc<Cache<Arc<V>>>,
    in_flight: Mutex<FnvHashMap<String, Flight<V>>>,
}

impl<V> ReadThrough<V>
where
    V: Send + Sync + 'static,
{
    fn new(cache: Arc<Cache<Arc<V>>>) -> Self {
        Self {
            cache,
            in_flight: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Fresh value for `key`, joining the in-flight fetch or starting one with `fetch`.
    async fn get<F>(&self, key: String, fetch: F) -> Result<Arc<V>, DataError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<V, DataError>>,
    {
        let flight = {
            let mut in_flight = self.in_flight.lock();

            if let Some(value) = self.cache.get(&key) {
                debug!(%key, "cache hit");
                return Ok(value);
            }

            match in_flight.get(&key) {
                Some(flight) => {
                    debug!(%key, "joining in-flight fetch");
                    flight.clone()
                }
                None => {
                    let flight = fetch_into(Arc::clone(&self.cache), key.clone(), fetch())
                        .boxed()
                        .shared();
                    in_flight.insert(key.clone(), flight.clone());
                    flight
                }
            }
        };

        let result = flight.clone().await;

        let mut in_flight = self.in_flight.lock();
        if in_flight
            .get(&key)
            .is_some_and(|current| current.ptr_eq(&flight))
        {
            in_flight.remove(&key);
        }

        result
    }
}

async fn fetch_into<V>(
    cache: Arc<Cache<Arc<V>>>,
    key: String,
    fetch: BoxFuture<'static, Result<V, DataError>>,
) -> Result<Arc<V>, DataError> {
    match fetch.await {
        Ok(value) => {
            let value = Arc::new(value);
            cache.put(key, Arc::clone(&value));
            Ok(value)
        }
        Err(error) => match cache.peek(&key) {
            Some(stale) => {
                warn!(%key, %error, fetched_at = %stale.fetched_at, "upstream failed, serving stale data");
                Ok(stale.value)
            }
            None => Err(error),
        },
    }
}
