//! Live connection protocol.
//!
//! Every message, in either direction, is a JSON envelope `{"type": ..., "data": {...}}`.

use crate::{
    error::DataError,
    model::{CoinId, CoinMarket, GlobalStats, MarketSnapshot, SinglePrice, TrendingCoin},
};
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Coin requested by a `get_live_price` message that omits `coin_id`.
pub const DEFAULT_LIVE_PRICE_COIN: &str = "bitcoin";

/// Outbound message serialised once and shared by every recipient.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Display)]
pub struct Frame(Arc<str>);

impl Frame {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Frame {
    fn from(json: String) -> Self {
        Self(Arc::from(json))
    }
}

/// Messages received from a live connection.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InboundMessage {
    SubscribeToCoin {
        coin_id: CoinId,
    },
    GetLivePrice {
        #[serde(default = "default_live_price_coin")]
        coin_id: CoinId,
    },
}

fn default_live_price_coin() -> CoinId {
    CoinId::new(DEFAULT_LIVE_PRICE_COIN)
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Messages sent to a live connection.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    Status {
        msg: String,
    },
    PriceUpdate {
        coins: Vec<CoinMarket>,
        global: GlobalStats,
        timestamp: i64,
    },
    TrendingUpdate {
        trending: Vec<TrendingCoin>,
    },
    LivePriceResponse {
        coin_id: CoinId,
        price: f64,
        change_24h: f64,
        timestamp: i64,
    },
    LivePriceError {
        error: String,
    },
    SubscriptionConfirmed {
        coin_id: CoinId,
    },
}

impl OutboundMessage {
    pub fn status(msg: impl Into<String>) -> Self {
        Self::Status { msg: msg.into() }
    }

    pub fn price_update(snapshot: &MarketSnapshot) -> Self {
        Self::PriceUpdate {
            coins: snapshot.coins.clone(),
            global: snapshot.global,
            timestamp: snapshot.fetched_at.timestamp_millis(),
        }
    }

    pub fn trending_update(snapshot: &MarketSnapshot) -> Self {
        Self::TrendingUpdate {
            trending: snapshot.trending.clone(),
        }
    }

    pub fn live_price_response(coin_id: CoinId, price: SinglePrice, time: DateTime<Utc>) -> Self {
        Self::LivePriceResponse {
            coin_id,
            price: price.price,
            change_24h: price.change_24h,
            timestamp: time.timestamp_millis(),
        }
    }

    /// Map an on-demand fetch failure to the message shown to the requesting client.
    pub fn live_price_error(error: &DataError) -> Self {
        let error = match error {
            DataError::CoinNotFound(coin) => format!("Coin {coin} not found"),
            _ => "Failed to fetch live price data".to_string(),
        };
        Self::LivePriceError { error }
    }

    pub fn subscription_confirmed(coin_id: CoinId) -> Self {
        Self::SubscriptionConfirmed { coin_id }
    }

    /// Serialise into a [`Frame`] ready to be shared across connections.
    pub fn to_frame(&self) -> Result<Frame, DataError> {
        serde_json::to_string(self)
            .map(Frame::from)
            .map_err(|error| DataError::Serialise(error.to_string()))
    }
}
