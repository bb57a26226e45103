use crate::{
    error::DataError,
    model::{CoinHistory, CoinId, MarketSnapshot, SinglePrice},
};
use async_trait::async_trait;
use std::{collections::BTreeSet, future::Future, sync::Arc, time::Duration};
use tracing::warn;

/// [`MarketDataSource`] implementation backed by the CoinGecko public REST API.
pub mod coingecko;

/// Default upper bound on a single upstream call (10 seconds).
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream provider of market data.
///
/// Implementations own any retry or backoff behaviour, callers treat every error as final.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Fetch a [`MarketSnapshot`] covering (at least) the provided coins, plus global stats
    /// and the trending ranking.
    async fn fetch_market_snapshot(
        &self,
        coins: &BTreeSet<CoinId>,
    ) -> Result<MarketSnapshot, DataError>;

    /// Fetch the current price of a single coin.
    async fn fetch_single_price(&self, coin: &CoinId) -> Result<SinglePrice, DataError>;

    /// Fetch `days` of price history for a single coin.
    async fn fetch_coin_history(&self, coin: &CoinId, days: u32)
    -> Result<CoinHistory, DataError>;
}

#[async_trait]
impl<S> MarketDataSource for Arc<S>
where
    S: MarketDataSource + ?Sized,
{
    async fn fetch_market_snapshot(
        &self,
        coins: &BTreeSet<CoinId>,
    ) -> Result<MarketSnapshot, DataError> {
        (**self).fetch_market_snapshot(coins).await
    }

    async fn fetch_single_price(&self, coin: &CoinId) -> Result<SinglePrice, DataError> {
        (**self).fetch_single_price(coin).await
    }

    async fn fetch_coin_history(
        &self,
        coin: &CoinId,
        days: u32,
    ) -> Result<CoinHistory, DataError> {
        (**self).fetch_coin_history(coin, days).await
    }
}

/// [`MarketDataSource`] wrapper that bounds every call with a timeout.
///
/// An elapsed call is reported as [`DataError::UpstreamTimeout`], identical to a timeout
/// surfaced by the inner source.
#[derive(Debug, Clone)]
pub struct TimeoutSource<S> {
    inner: S,
    timeout: Duration,
}

impl<S> TimeoutSource<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Wrap `inner` with the [`DEFAULT_UPSTREAM_TIMEOUT`].
    pub fn with_default_timeout(inner: S) -> Self {
        Self::new(inner, DEFAULT_UPSTREAM_TIMEOUT)
    }

    async fn bounded<T, Fut>(&self, operation: &'static str, future: Fut) -> Result<T, DataError>
    where
        Fut: Future<Output = Result<T, DataError>>,
    {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => result,
            Err(_elapsed) => {
                warn!(
                    operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "upstream call exceeded timeout"
                );
                Err(DataError::UpstreamTimeout)
            }
        }
    }
}

#[async_trait]
impl<S> MarketDataSource for TimeoutSource<S>
where
    S: MarketDataSource,
{
    async fn fetch_market_snapshot(
        &self,
        coins: &BTreeSet<CoinId>,
    ) -> Result<MarketSnapshot, DataError> {
        self.bounded(
            "fetch_market_snapshot",
            self.inner.fetch_market_snapshot(coins),
        )
        .await
    }

    async fn fetch_single_price(&self, coin: &CoinId) -> Result<SinglePrice, DataError> {
        self.bounded("fetch_single_price", self.inner.fetch_single_price(coin))
            .await
    }

    async fn fetch_coin_history(
        &self,
        coin: &CoinId,
        days: u32,
    ) -> Result<CoinHistory, DataError> {
        self.bounded(
            "fetch_coin_history",
            self.inner.fetch_coin_history(coin, days),
        )
        .await
    }
}
