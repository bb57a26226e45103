use coinwatch_data::{
    cache::DEFAULT_CACHE_TTL,
    model::CoinId,
    refresh::{DEFAULT_COINS, DEFAULT_REFRESH_INTERVAL},
    source::{DEFAULT_UPSTREAM_TIMEOUT, coingecko::BASE_URL_COINGECKO},
};
use std::{collections::BTreeSet, fmt::Display, net::SocketAddr, str::FromStr, time::Duration};
use tracing::warn;

/// Server configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Live WebSocket feed listen address
    pub ws_addr: SocketAddr,
    /// JSON REST API listen address
    pub http_addr: SocketAddr,
    pub coingecko_base_url: String,
    /// Period between market refresh ticks
    pub refresh_interval: Duration,
    pub cache_ttl: Duration,
    /// Upper bound on every upstream call
    pub upstream_timeout: Duration,
    /// Coins refreshed every tick regardless of subscriptions
    pub default_coins: BTreeSet<CoinId>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_addr: SocketAddr::from(([0, 0, 0, 0], 9001)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            coingecko_base_url: BASE_URL_COINGECKO.to_string(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            cache_ttl: DEFAULT_CACHE_TTL,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            default_coins: DEFAULT_COINS.into_iter().map(CoinId::new).collect(),
        }
    }
}

impl ServerConfig {
    /// Read configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration using `lookup` to resolve each variable.
    ///
    /// Invalid values are logged and replaced by the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();

        Self {
            ws_addr: parse_or(&lookup, "WS_ADDR", default.ws_addr),
            http_addr: parse_or(&lookup, "HTTP_ADDR", default.http_addr),
            coingecko_base_url: lookup("COINGECKO_BASE_URL")
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty())
                .unwrap_or(default.coingecko_base_url),
            refresh_interval: secs_or(&lookup, "REFRESH_INTERVAL_SECS", default.refresh_interval),
            cache_ttl: secs_or(&lookup, "CACHE_TTL_SECS", default.cache_ttl),
            upstream_timeout: secs_or(&lookup, "UPSTREAM_TIMEOUT_SECS", default.upstream_timeout),
            default_coins: coins_or(&lookup, "DEFAULT_COINS", default.default_coins),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Display,
{
    let Some(raw) = lookup(key) else {
        return default;
    };

    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, %default, "invalid config value, using default");
            default
        }
    }
}

/// Non-zero whole seconds.
fn secs_or<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return default;
    };

    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Duration::from_secs(secs),
        _ => {
            warn!(
                key,
                value = %raw,
                default_secs = default.as_secs(),
                "invalid config value, using default"
            );
            default
        }
    }
}

/// Comma separated coin ids, eg/ "bitcoin,ethereum,dogecoin".
fn coins_or<F>(lookup: &F, key: &str, default: BTreeSet<CoinId>) -> BTreeSet<CoinId>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return default;
    };

    let coins = raw
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(CoinId::new)
        .collect::<BTreeSet<_>>();

    if coins.is_empty() {
        warn!(key, value = %raw, "no coins configured, using default");
        default
    } else {
        coins
    }
}
