use anyhow::Context;
use coinwatch_data::{
    reader::{HistoryCache, MarketReader},
    refresh::{RefreshConfig, RefreshLoop, SnapshotCache},
    registry::ConnectionRegistry,
    source::{MarketDataSource, TimeoutSource, coingecko::CoinGecko},
};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::watch};
use tracing::{info, warn};

mod config;
mod http;
mod ws;

use config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting coinwatch market data server");

    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let coingecko = CoinGecko::new(&config.coingecko_base_url, config.upstream_timeout)
        .context("invalid COINGECKO_BASE_URL")?;
    let source: Arc<dyn MarketDataSource> =
        Arc::new(TimeoutSource::new(coingecko, config.upstream_timeout));

    let registry = Arc::new(ConnectionRegistry::new());
    let overview = Arc::new(SnapshotCache::new(config.cache_ttl));
    let history = Arc::new(HistoryCache::new(config.cache_ttl));

    let refresh = Arc::new(RefreshLoop::new(
        source.clone(),
        overview.clone(),
        registry.clone(),
        RefreshConfig::default()
            .with_interval(config.refresh_interval)
            .with_default_coins(config.default_coins.iter().cloned()),
    ));
    let reader = Arc::new(
        MarketReader::new(source, overview, history, config.default_coins.clone())
            .with_registry(registry.clone()),
    );

    let ws_listener = TcpListener::bind(config.ws_addr)
        .await
        .with_context(|| format!("failed to bind WebSocket server to {}", config.ws_addr))?;
    let http_listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP API to {}", config.http_addr))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let refresh_task = tokio::spawn({
        let refresh = refresh.clone();
        let shutdown = shutdown_rx.clone();
        async move { refresh.run(shutdown).await }
    });
    let ws_task = tokio::spawn(ws::serve(
        ws_listener,
        registry.clone(),
        refresh.clone(),
        shutdown_rx.clone(),
    ));
    let http_task = tokio::spawn(http::serve(
        http_listener,
        http::AppState {
            reader,
            registry,
            refresh,
        },
        shutdown_rx,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    if shutdown_tx.send(true).is_err() {
        warn!("All tasks already stopped before shutdown signal");
    }

    let (refresh_result, ws_result, http_result) = tokio::join!(refresh_task, ws_task, http_task);
    refresh_result.context("refresh loop panicked")?;
    ws_result.context("WebSocket server panicked")?;
    http_result
        .context("HTTP API panicked")?
        .context("HTTP API failed")?;

    info!("Shutdown complete");
    Ok(())
}

/// Initialise `tracing`, honouring `RUST_LOG` (default `info`) and `LOG_FORMAT=json`.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .flatten_event(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use coinwatch_data::{
        cache::DEFAULT_CACHE_TTL,
        error::DataError,
        model::{
            CoinHistory, CoinId, CoinMarket, GlobalStats, MarketSnapshot, SinglePrice,
            TrendingCoin,
        },
        refresh::{RefreshConfig, RefreshLoop, SnapshotCache},
        registry::ConnectionRegistry,
        source::MarketDataSource,
    };
    use std::{collections::BTreeSet, sync::Arc};

    /// [`MarketDataSource`] answering every call with fixed data, or a fixed error.
    #[derive(Debug, Default)]
    pub(crate) struct StaticSource {
        error: Option<DataError>,
    }

    impl StaticSource {
        pub(crate) fn failing(error: DataError) -> Self {
            Self { error: Some(error) }
        }

        fn check(&self) -> Result<(), DataError> {
            match &self.error {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            }
        }

        fn time() -> DateTime<Utc> {
            DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap()
        }
    }

    #[async_trait]
    impl MarketDataSource for StaticSource {
        async fn fetch_market_snapshot(
            &self,
            coins: &BTreeSet<CoinId>,
        ) -> Result<MarketSnapshot, DataError> {
            self.check()?;
            Ok(MarketSnapshot {
                coins: coins
                    .iter()
                    .enumerate()
                    .map(|(rank, id)| CoinMarket {
                        id: id.clone(),
                        symbol: id.as_str().chars().take(3).collect(),
                        name: id.to_string(),
                        price: 100.0 * (rank + 1) as f64,
                        change_24h: 1.5,
                        market_cap: 1.0e9,
                        volume: 1.0e7,
                        market_cap_rank: Some(rank as u32 + 1),
                    })
                    .collect(),
                global: GlobalStats {
                    total_market_cap: 2.4e12,
                    total_volume: 9.1e10,
                    btc_dominance: 52.3,
                    active_crypto_count: 14_000,
                },
                trending: ["pepe", "sui"]
                    .into_iter()
                    .map(|id| TrendingCoin {
                        id: CoinId::new(id),
                        symbol: id.to_uppercase(),
                        name: id.to_string(),
                        market_cap_rank: None,
                    })
                    .collect(),
                fetched_at: Self::time(),
            })
        }

        async fn fetch_single_price(&self, _: &CoinId) -> Result<SinglePrice, DataError> {
            self.check()?;
            Ok(SinglePrice {
                price: 0.15,
                change_24h: 2.5,
            })
        }

        async fn fetch_coin_history(
            &self,
            coin: &CoinId,
            days: u32,
        ) -> Result<CoinHistory, DataError> {
            self.check()?;
            Ok(CoinHistory {
                coin_id: coin.clone(),
                days,
                prices: vec![[1_700_000_000_000.0, 64_000.0]],
                market_caps: vec![[1_700_000_000_000.0, 1.2e12]],
                total_volumes: vec![[1_700_000_000_000.0, 3.0e10]],
                fetched_at: Self::time(),
            })
        }
    }

    pub(crate) fn refresh_loop(
        source: impl MarketDataSource + 'static,
        registry: &Arc<ConnectionRegistry>,
    ) -> Arc<RefreshLoop> {
        Arc::new(RefreshLoop::new(
            Arc::new(source),
            Arc::new(SnapshotCache::new(DEFAULT_CACHE_TTL)),
            Arc::clone(registry),
            RefreshConfig::default(),
        ))
    }
}
