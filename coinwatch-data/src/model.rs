use chrono::{DateTime, Utc};
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Longest [`CoinId`] accepted by [`CoinId::is_valid`].
pub const MAX_COIN_ID_LEN: usize = 128;

/// CoinGecko coin identifier (eg/ "bitcoin", "ethereum", "dogecoin").
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, From, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct CoinId(pub SmolStr);

impl CoinId {
    pub fn new<S: AsRef<str>>(id: S) -> Self {
        Self(SmolStr::new(id.as_ref().trim().to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// True if the identifier has the shape of an upstream coin id (eg/ "usd-coin").
    ///
    /// Only ascii lowercase letters, digits, `-`, `_` and `.` are accepted, and never a
    /// bare `.` or `..` segment.
    pub fn is_valid(&self) -> bool {
        let id = self.as_str();
        !id.is_empty()
            && id.len() <= MAX_COIN_ID_LEN
            && id != "."
            && id != ".."
            && id.bytes().all(|byte| {
                byte.is_ascii_lowercase()
                    || byte.is_ascii_digit()
                    || matches!(byte, b'-' | b'_' | b'.')
            })
    }
}

impl From<&str> for CoinId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Market statistics for a single coin.
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct CoinMarket {
    pub id: CoinId,
    pub symbol: String,
    pub name: String,
    /// Current price in USD.
    pub price: f64,
    /// 24h price change percentage.
    pub change_24h: f64,
    pub market_cap: f64,
    /// 24h traded volume in USD.
    pub volume: f64,
    pub market_cap_rank: Option<u32>,
}

/// Aggregate statistics across the whole crypto market.
#[derive(Clone, Copy, PartialEq, PartialOrd, Debug, Default, Deserialize, Serialize)]
pub struct GlobalStats {
    pub total_market_cap: f64,
    pub total_volume: f64,
    /// Bitcoin share of total market cap, as a percentage.
    pub btc_dominance: f64,
    pub active_crypto_count: u64,
}

/// Entry of the upstream trending-search ranking.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct TrendingCoin {
    pub id: CoinId,
    pub symbol: String,
    pub name: String,
    pub market_cap_rank: Option<u32>,
}

/// Immutable view of the market produced once per refresh tick.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct MarketSnapshot {
    pub coins: Vec<CoinMarket>,
    pub global: GlobalStats,
    pub trending: Vec<TrendingCoin>,
    pub fetched_at: DateTime<Utc>,
}

impl MarketSnapshot {
    /// Find the [`CoinMarket`] for the provided [`CoinId`].
    pub fn coin(&self, id: &CoinId) -> Option<&CoinMarket> {
        self.coins.iter().find(|coin| &coin.id == id)
    }

    /// Ordered identifiers of the trending ranking.
    pub fn trending_ids(&self) -> Vec<CoinId> {
        self.trending.iter().map(|coin| coin.id.clone()).collect()
    }
}

/// Point-in-time price of a single coin.
#[derive(Clone, Copy, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct SinglePrice {
    pub price: f64,
    pub change_24h: f64,
}

/// Price history of a single coin, each point being `[epoch_ms, value]`.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct CoinHistory {
    pub coin_id: CoinId,
    pub days: u32,
    pub prices: Vec<[f64; 2]>,
    pub market_caps: Vec<[f64; 2]>,
    pub total_volumes: Vec<[f64; 2]>,
    pub fetched_at: DateTime<Utc>,
}
