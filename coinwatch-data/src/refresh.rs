//! Periodic market refresh and fan-out to live connections.
//!
//! Each tick walks `Idle -> Fetching -> Publishing -> Idle`. Only one tick is ever in
//! flight. A failed fetch leaves the cache and registry untouched and is retried on the
//! next tick, so clients keep whatever they were last sent.

use crate::{
    cache::{Cache, CacheKey},
    clock::{Clock, SystemClock},
    error::DataError,
    model::{CoinId, MarketSnapshot},
    protocol::OutboundMessage,
    registry::{BroadcastReport, ConnectionId, ConnectionRegistry},
    source::MarketDataSource,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex as AsyncMutex, watch},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

/// Default period between refresh ticks (30 seconds).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Coins refreshed every tick regardless of subscriptions (top 10 by market cap).
pub const DEFAULT_COINS: [&str; 10] = [
    "bitcoin",
    "ethereum",
    "tether",
    "binancecoin",
    "solana",
    "ripple",
    "usd-coin",
    "cardano",
    "dogecoin",
    "tron",
];

/// [`Cache`] holding the latest [`MarketSnapshot`].
pub type SnapshotCache = Cache<Arc<MarketSnapshot>>;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPhase {
    #[default]
    Idle,
    Fetching,
    Publishing,
}

/// Result of a single [`RefreshLoop::tick`].
#[derive(Clone, PartialEq, Debug)]
pub enum TickOutcome {
    Published {
        price_update: BroadcastReport,
        /// `None` if the trending ranking was unchanged since the previous tick.
        trending_update: Option<BroadcastReport>,
    },
    Failed(DataError),
    /// Another tick was already in flight.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub interval: Duration,
    pub default_coins: BTreeSet<CoinId>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REFRESH_INTERVAL,
            default_coins: DEFAULT_COINS.into_iter().map(CoinId::new).collect(),
        }
    }
}

impl RefreshConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_default_coins(mut self, coins: impl IntoIterator<Item = CoinId>) -> Self {
        self.default_coins = coins.into_iter().collect();
        self
    }
}

/// State carried between ticks, owned by whichever tick holds the single-flight guard.
#[derive(Debug, Default)]
struct TickState {
    previous_trending: Option<Vec<CoinId>>,
}

pub struct RefreshLoop {
    source: Arc<dyn MarketDataSource>,
    cache: Arc<SnapshotCache>,
    registry: Arc<ConnectionRegistry>,
    config: RefreshConfig,
    clock: Arc<dyn Clock>,
    phase: Mutex<RefreshPhase>,
    tick_state: AsyncMutex<TickState>,
}

impl fmt::Debug for RefreshLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshLoop")
            .field("config", &self.config)
            .field("phase", &self.phase())
            .field("connections", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl RefreshLoop {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        cache: Arc<SnapshotCache>,
        registry: Arc<ConnectionRegistry>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            source,
            cache,
            registry,
            config,
            clock: Arc::new(SystemClock),
            phase: Mutex::new(RefreshPhase::Idle),
            tick_state: AsyncMutex::new(TickState::default()),
        }
    }

    /// Use `clock` to timestamp on-demand live price responses.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn phase(&self) -> RefreshPhase {
        *self.phase.lock()
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    /// Coins requested from upstream: every subscribed coin plus the default set.
    pub fn requested_coins(&self) -> BTreeSet<CoinId> {
        let mut coins = self.registry.subscribed_coins();
        coins.extend(self.config.default_coins.iter().cloned());
        coins
    }

    /// Run a single fetch-and-publish cycle.
    pub async fn tick(&self) -> TickOutcome {
        let Ok(mut state) = self.tick_state.try_lock() else {
            debug!("refresh tick already in flight, skipping");
            return TickOutcome::Skipped;
        };

        let coins = self.requested_coins();
        let phase = PhaseGuard::enter(&self.phase, RefreshPhase::Fetching);

        let snapshot = match self.source.fetch_market_snapshot(&coins).await {
            Ok(snapshot) => Arc::new(snapshot),
            Err(error) => {
                warn!(%error, coins = coins.len(), "market refresh failed, keeping cached data");
                return TickOutcome::Failed(error);
            }
        };

        phase.transition(RefreshPhase::Publishing);
        self.publish(&mut state, snapshot)
    }

    fn publish(&self, state: &mut TickState, snapshot: Arc<MarketSnapshot>) -> TickOutcome {
        self.cache
            .put(CacheKey::market_overview(), Arc::clone(&snapshot));

        let price_update = self.broadcast(OutboundMessage::price_update(&snapshot));

        let trending = snapshot.trending_ids();
        let trending_update = if state.previous_trending.as_ref() != Some(&trending) {
            Some(self.broadcast(OutboundMessage::trending_update(&snapshot)))
        } else {
            None
        };
        state.previous_trending = Some(trending);

        debug!(
            coins = snapshot.coins.len(),
            delivered = price_update.delivered,
            dropped = price_update.removed.len(),
            trending_changed = trending_update.is_some(),
            "published market snapshot"
        );

        TickOutcome::Published {
            price_update,
            trending_update,
        }
    }

    fn broadcast(&self, message: OutboundMessage) -> BroadcastReport {
        match message.to_frame() {
            Ok(frame) => self.registry.broadcast(&frame),
            Err(error) => {
                warn!(%error, "failed to serialise broadcast");
                BroadcastReport::default()
            }
        }
    }

    /// Tick every [`RefreshConfig::interval`] until `shutdown` changes or its sender drops.
    ///
    /// The first tick fires immediately.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.interval.as_secs(),
            default_coins = self.config.default_coins.len(),
            "starting market refresh loop"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let TickOutcome::Published { price_update, .. } = self.tick().await {
                        info!(clients = price_update.delivered, "broadcast price update");
                    }
                }
                _ = shutdown.changed() => {
                    info!("market refresh loop shutting down");
                    break;
                }
            }
        }
    }

    /// Fetch a single coin's price out-of-band and reply to `connection` only.
    ///
    /// Upstream failures are reported to the requester as `live_price_error`. The returned
    /// error only describes a failure to deliver the reply.
    pub async fn live_price(&self, connection: ConnectionId, coin: CoinId) -> Result<(), DataError> {
        let message = match self.source.fetch_single_price(&coin).await {
            Ok(price) => {
                debug!(%connection, %coin, price = price.price, "live price fetched");
                OutboundMessage::live_price_response(coin, price, self.clock.now())
            }
            Err(error) => {
                warn!(%connection, %coin, %error, "live price request failed");
                OutboundMessage::live_price_error(&error)
            }
        };

        self.registry.send_to(connection, message.to_frame()?)
    }
}

/// Sets the phase on construction and restores [`RefreshPhase::Idle`] when dropped, including
/// when a tick is cancelled mid-fetch.
struct PhaseGuard<'a> {
    phase: &'a Mutex<RefreshPhase>,
}

impl<'a> PhaseGuard<'a> {
    fn enter(phase: &'a Mutex<RefreshPhase>, next: RefreshPhase) -> Self {
        *phase.lock() = next;
        Self { phase }
    }

    fn transition(&self, next: RefreshPhase) {
        *self.phase.lock() = next;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.phase.lock() = RefreshPhase::Idle;
    }
}
