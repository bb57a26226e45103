#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity)]

//! # Coinwatch-Data
//! Cached cryptocurrency market data with a periodic refresh loop that fans updates out to
//! live connections.
//!
//! * **Cached**: upstream responses are held in a time-to-live [`Cache`](cache::Cache) and
//!   served stale rather than not at all when the upstream is down.
//! * **Single-flight**: the [`RefreshLoop`](refresh::RefreshLoop) never overlaps two ticks,
//!   so every connection observes updates in tick order.
//! * **Pluggable**: the upstream is a [`MarketDataSource`](source::MarketDataSource) trait
//!   object, with a CoinGecko implementation provided.
//!
//! ## Example
//! ```rust,no_run
//! use coinwatch_data::{
//!     cache::DEFAULT_CACHE_TTL,
//!     refresh::{RefreshConfig, RefreshLoop, SnapshotCache},
//!     registry::ConnectionRegistry,
//!     source::{TimeoutSource, coingecko::{BASE_URL_COINGECKO, CoinGecko}},
//! };
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let coingecko = CoinGecko::new(BASE_URL_COINGECKO, std::time::Duration::from_secs(10))
//!         .expect("valid base url");
//!
//!     let refresh = RefreshLoop::new(
//!         Arc::new(TimeoutSource::with_default_timeout(coingecko)),
//!         Arc::new(SnapshotCache::new(DEFAULT_CACHE_TTL)),
//!         Arc::new(ConnectionRegistry::new()),
//!         RefreshConfig::default(),
//!     );
//!
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     refresh.run(shutdown_rx).await;
//! }
//! ```

/// Time-to-live [`Cache`](cache::Cache) and the keys market data is stored under.
pub mod cache;

/// Injectable wall-clock time.
pub mod clock;

/// All [`Error`](std::error::Error)s generated in Coinwatch-Data.
pub mod error;

/// Market data model: coins, global stats, trending ranking and price history.
pub mod model;

/// Inbound and outbound live connection messages.
pub mod protocol;

/// Cache read path with stale-but-available fallback.
pub mod reader;

/// Periodic fetch-and-publish loop plus on-demand live prices.
pub mod refresh;

/// Open connections, their subscriptions, and broadcast fan-out.
pub mod registry;

/// Per-connection inbound message dispatch.
pub mod session;

/// Upstream [`MarketDataSource`](source::MarketDataSource) abstraction and implementations.
pub mod source;
