use super::MarketDataSource;
use crate::{
    error::DataError,
    model::{
        CoinHistory, CoinId, CoinMarket, GlobalStats, MarketSnapshot, SinglePrice, TrendingCoin,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use fnv::FnvHashMap;
use itertools::Itertools;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, de::DeserializeOwned};
use std::{collections::BTreeSet, time::Duration};
use tracing::{debug, warn};
use url::Url;

/// [`CoinGecko`] public REST API base url.
///
/// See docs: <https://docs.coingecko.com/v3.0.1/reference/introduction>
pub const BASE_URL_COINGECKO: &str = "https://api.coingecko.com/api/v3/";

/// Currency every price, market cap and volume is quoted in.
pub const VS_CURRENCY: &str = "usd";

/// Upper bound on `per_page` accepted by the `coins/markets` endpoint.
const MAX_PER_PAGE: usize = 250;

/// Coins returned by `coins/markets` when no explicit ids are requested.
const DEFAULT_PER_PAGE: usize = 10;

/// CoinGecko [`MarketDataSource`].
#[derive(Debug, Clone)]
pub struct CoinGecko {
    client: Client,
    base_url: Url,
}

impl CoinGecko {
    /// Construct a [`CoinGecko`] source whose HTTP client enforces `timeout` per request.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DataError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|error| DataError::Upstream(format!("invalid base url {base_url}: {error}")))?;

        // Url::join replaces the final path segment unless the base ends with '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("coinwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| DataError::Upstream(error.to_string()))?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, DataError> {
        self.base_url
            .join(path)
            .map_err(|error| DataError::Upstream(format!("invalid endpoint {path}: {error}")))
    }

    /// Endpoint `coins/{coin}/{suffix}`, with the coin id escaped as a single path segment.
    fn coin_endpoint(&self, coin: &CoinId, suffix: &str) -> Result<Url, DataError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                DataError::Upstream(format!("base url {} cannot carry a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(["coins", coin.as_str(), suffix]);
        Ok(url)
    }

    /// GET `url` and deserialise the JSON body.
    ///
    /// `coin` is reported as [`DataError::CoinNotFound`] if the endpoint responds 404.
    async fn get_json<T>(
        &self,
        url: Url,
        query: &[(&str, String)],
        coin: Option<&CoinId>,
    ) -> Result<T, DataError>
    where
        T: DeserializeOwned,
    {
        debug!(%url, ?query, "requesting CoinGecko");

        let response = self.client.get(url).query(query).send().await?;

        match (response.status(), coin) {
            (StatusCode::TOO_MANY_REQUESTS, _) => {
                warn!(path = response.url().path(), "CoinGecko rate limit hit");
                return Err(DataError::UpstreamRateLimited);
            }
            (StatusCode::NOT_FOUND, Some(coin)) => {
                return Err(DataError::CoinNotFound(coin.clone()));
            }
            _ => {}
        }

        let body = response.error_for_status()?.bytes().await?;
        serde_json::from_slice(&body).map_err(DataError::from)
    }

    async fn fetch_markets(&self, coins: &BTreeSet<CoinId>) -> Result<Vec<CoinMarket>, DataError> {
        let queries = market_queries(coins);
        let multi_page = queries.len() > 1;

        let mut markets = Vec::with_capacity(coins.len());
        for query in queries {
            let page: Vec<CoinGeckoMarket> = self
                .get_json(self.endpoint("coins/markets")?, &query, None)
                .await?;
            markets.extend(page.into_iter().map(CoinMarket::from));
        }

        if multi_page {
            markets.sort_by(|a, b| b.market_cap.total_cmp(&a.market_cap));
        }

        Ok(markets)
    }

    async fn fetch_global(&self) -> Result<GlobalStats, DataError> {
        let global: CoinGeckoGlobal = self.get_json(self.endpoint("global")?, &[], None).await?;
        Ok(GlobalStats::from(global.data))
    }

    async fn fetch_trending(&self) -> Result<Vec<TrendingCoin>, DataError> {
        let trending: CoinGeckoTrending = self
            .get_json(self.endpoint("search/trending")?, &[], None)
            .await?;
        Ok(trending
            .coins
            .into_iter()
            .map(|entry| TrendingCoin::from(entry.item))
            .collect())
    }
}

#[async_trait]
impl MarketDataSource for CoinGecko {
    async fn fetch_market_snapshot(
        &self,
        coins: &BTreeSet<CoinId>,
    ) -> Result<MarketSnapshot, DataError> {
        let (coins, global, trending) = tokio::try_join!(
            self.fetch_markets(coins),
            self.fetch_global(),
            self.fetch_trending()
        )?;

        Ok(MarketSnapshot {
            coins,
            global,
            trending,
            fetched_at: Utc::now(),
        })
    }

    async fn fetch_single_price(&self, coin: &CoinId) -> Result<SinglePrice, DataError> {
        if !coin.is_valid() {
            return Err(DataError::CoinNotFound(coin.clone()));
        }

        let query = [
            ("ids", coin.to_string()),
            ("vs_currencies", VS_CURRENCY.to_string()),
            ("include_24hr_change", "true".to_string()),
        ];

        let prices: CoinGeckoSimplePrices = self
            .get_json(self.endpoint("simple/price")?, &query, Some(coin))
            .await?;
        single_price_from(prices, coin)
    }

    async fn fetch_coin_history(
        &self,
        coin: &CoinId,
        days: u32,
    ) -> Result<CoinHistory, DataError> {
        if !coin.is_valid() {
            return Err(DataError::CoinNotFound(coin.clone()));
        }

        let query = [
            ("vs_currency", VS_CURRENCY.to_string()),
            ("days", days.to_string()),
        ];

        let chart: CoinGeckoMarketChart = self
            .get_json(self.coin_endpoint(coin, "market_chart")?, &query, Some(coin))
            .await?;

        Ok(CoinHistory {
            coin_id: coin.clone(),
            days,
            prices: chart.prices,
            market_caps: chart.market_caps,
            total_volumes: chart.total_volumes,
            fetched_at: Utc::now(),
        })
    }
}

/// Query strings for the `coins/markets` pages covering `coins`.
///
/// An empty set asks for the top [`DEFAULT_PER_PAGE`] coins by market cap. Otherwise the valid
/// ids are split into pages of at most [`MAX_PER_PAGE`], since upstream caps `per_page` and
/// silently drops the remaining ids.
fn market_queries(coins: &BTreeSet<CoinId>) -> Vec<Vec<(&'static str, String)>> {
    let base = || {
        vec![
            ("vs_currency", VS_CURRENCY.to_string()),
            ("order", "market_cap_desc".to_string()),
            ("page", "1".to_string()),
            ("sparkline", "false".to_string()),
            ("price_change_percentage", "24h".to_string()),
        ]
    };

    if coins.is_empty() {
        let mut query = base();
        query.push(("per_page", DEFAULT_PER_PAGE.to_string()));
        return vec![query];
    }

    let pages = coins
        .iter()
        .filter(|coin| {
            let valid = coin.is_valid();
            if !valid {
                debug!(%coin, "skipping malformed coin id");
            }
            valid
        })
        .chunks(MAX_PER_PAGE);

    let mut queries = Vec::new();
    for page in &pages {
        let page = page.collect::<Vec<_>>();
        let mut query = base();
        query.push(("ids", page.iter().join(",")));
        query.push(("per_page", page.len().to_string()));
        queries.push(query);
    }
    queries
}

/// Entry of the [`coins/markets`](https://docs.coingecko.com/v3.0.1/reference/coins-markets)
/// response. Numeric fields are `null` for coins CoinGecko has no data for.
#[derive(Clone, PartialEq, Debug, Deserialize)]
struct CoinGeckoMarket {
    id: String,
    symbol: String,
    name: String,
    current_price: Option<f64>,
    price_change_percentage_24h: Option<f64>,
    market_cap: Option<f64>,
    total_volume: Option<f64>,
    market_cap_rank: Option<u32>,
}

impl From<CoinGeckoMarket> for CoinMarket {
    fn from(market: CoinGeckoMarket) -> Self {
        Self {
            id: CoinId::new(market.id),
            symbol: market.symbol,
            name: market.name,
            price: market.current_price.unwrap_or_default(),
            change_24h: market.price_change_percentage_24h.unwrap_or_default(),
            market_cap: market.market_cap.unwrap_or_default(),
            volume: market.total_volume.unwrap_or_default(),
            market_cap_rank: market.market_cap_rank,
        }
    }
}

#[derive(Clone, PartialEq, Debug, Deserialize)]
struct CoinGeckoGlobal {
    data: CoinGeckoGlobalData,
}

/// Subset of the [`global`](https://docs.coingecko.com/v3.0.1/reference/crypto-global) payload.
#[derive(Clone, PartialEq, Debug, Deserialize)]
struct CoinGeckoGlobalData {
    active_cryptocurrencies: u64,
    #[serde(default)]
    total_market_cap: FnvHashMap<String, f64>,
    #[serde(default)]
    total_volume: FnvHashMap<String, f64>,
    #[serde(default)]
    market_cap_percentage: FnvHashMap<String, f64>,
}

impl From<CoinGeckoGlobalData> for GlobalStats {
    fn from(data: CoinGeckoGlobalData) -> Self {
        Self {
            total_market_cap: data.total_market_cap.get(VS_CURRENCY).copied().unwrap_or_default(),
            total_volume: data.total_volume.get(VS_CURRENCY).copied().unwrap_or_default(),
            btc_dominance: data.market_cap_percentage.get("btc").copied().unwrap_or_default(),
            active_crypto_count: data.active_cryptocurrencies,
        }
    }
}

#[derive(Clone, PartialEq, Debug, Deserialize)]
struct CoinGeckoTrending {
    coins: Vec<CoinGeckoTrendingEntry>,
}

#[derive(Clone, PartialEq, Debug, Deserialize)]
struct CoinGeckoTrendingEntry {
    item: CoinGeckoTrendingCoin,
}

#[derive(Clone, PartialEq, Debug, Deserialize)]
struct CoinGeckoTrendingCoin {
    id: String,
    symbol: String,
    name: String,
    market_cap_rank: Option<u32>,
}

impl From<CoinGeckoTrendingCoin> for TrendingCoin {
    fn from(coin: CoinGeckoTrendingCoin) -> Self {
        Self {
            id: CoinId::new(coin.id),
            symbol: coin.symbol,
            name: coin.name,
            market_cap_rank: coin.market_cap_rank,
        }
    }
}

/// [`simple/price`](https://docs.coingecko.com/v3.0.1/reference/simple-price) response,
/// keyed by coin id. Unknown ids are silently omitted by CoinGecko.
type CoinGeckoSimplePrices = FnvHashMap<String, CoinGeckoSimplePrice>;

#[derive(Clone, Copy, PartialEq, Debug, Deserialize)]
struct CoinGeckoSimplePrice {
    usd: Option<f64>,
    usd_24h_change: Option<f64>,
}

fn single_price_from(
    mut prices: CoinGeckoSimplePrices,
    coin: &CoinId,
) -> Result<SinglePrice, DataError> {
    let entry = prices
        .remove(coin.as_str())
        .ok_or_else(|| DataError::CoinNotFound(coin.clone()))?;

    let price = entry.usd.ok_or_else(|| {
        DataError::UpstreamMalformedResponse(format!("simple/price missing usd for {coin}"))
    })?;

    Ok(SinglePrice {
        price,
        change_24h: entry.usd_24h_change.unwrap_or_default(),
    })
}

/// [`coins/{id}/market_chart`](https://docs.coingecko.com/v3.0.1/reference/coins-id-market-chart)
/// response.
#[derive(Clone, PartialEq, Debug, Deserialize)]
struct CoinGeckoMarketChart {
    prices: Vec<[f64; 2]>,
    market_caps: Vec<[f64; 2]>,
    total_volumes: Vec<[f64; 2]>,
}
