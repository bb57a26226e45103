//! Registry of open live connections and their coin subscriptions.
//!
//! Outbound delivery goes through an injected [`ConnectionSink`], so the registry never
//! touches a socket directly. A connection whose sink fails is dropped from the registry,
//! the remaining recipients are unaffected.

use crate::{error::DataError, model::CoinId, protocol::Frame};
use derive_more::Display;
use fnv::FnvHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Most coins a single connection may subscribe to.
pub const MAX_SUBSCRIPTIONS_PER_CONNECTION: usize = 50;

/// Unique identifier of a live connection.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
pub struct ConnectionId(pub u64);

/// Whether a connection is still held by the [`ConnectionRegistry`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// Returned by a [`ConnectionSink`] whose peer has gone away.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Error)]
#[error("connection sink closed")]
pub struct SinkClosed;

/// Outbound send capability for a single connection.
pub trait ConnectionSink: Debug + Send + Sync {
    fn send(&self, frame: Frame) -> Result<(), SinkClosed>;
}

impl ConnectionSink for mpsc::UnboundedSender<Frame> {
    fn send(&self, frame: Frame) -> Result<(), SinkClosed> {
        mpsc::UnboundedSender::send(self, frame).map_err(|_| SinkClosed)
    }
}

#[derive(Debug)]
struct Connection {
    subscriptions: BTreeSet<CoinId>,
    sink: Arc<dyn ConnectionSink>,
}

/// Outcome of a broadcast.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub removed: Vec<ConnectionId>,
}

/// Predicate selecting connections subscribed to `coin`.
pub fn subscribes_to(coin: &CoinId) -> impl Fn(&BTreeSet<CoinId>) -> bool + '_ {
    move |subscriptions| subscriptions.contains(coin)
}

/// Predicate selecting connections subscribed to at least one coin.
pub fn subscribes_to_any() -> impl Fn(&BTreeSet<CoinId>) -> bool {
    |subscriptions| !subscriptions.is_empty()
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<FnvHashMap<ConnectionId, Connection>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an open connection with no subscriptions and return its [`ConnectionId`].
    pub fn register(&self, sink: Arc<dyn ConnectionSink>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.connections.write().insert(
            id,
            Connection {
                subscriptions: BTreeSet::new(),
                sink,
            },
        );
        debug!(%id, "registered connection");
        id
    }

    /// Subscribe a connection to a coin, returning `true` if it was not already subscribed.
    ///
    /// An unknown connection (eg/ raced with a disconnect) is logged and reported as
    /// [`DataError::UnknownConnection`], which callers are expected to absorb. A connection
    /// already holding [`MAX_SUBSCRIPTIONS_PER_CONNECTION`] coins is refused further ones with
    /// [`DataError::SubscriptionLimit`].
    pub fn subscribe(&self, id: ConnectionId, coin: CoinId) -> Result<bool, DataError> {
        match self.connections.write().get_mut(&id) {
            Some(connection) if connection.subscriptions.contains(&coin) => Ok(false),
            Some(connection)
                if connection.subscriptions.len() >= MAX_SUBSCRIPTIONS_PER_CONNECTION =>
            {
                debug!(%id, %coin, "subscription limit reached, subscribe refused");
                Err(DataError::SubscriptionLimit(id))
            }
            Some(connection) => Ok(connection.subscriptions.insert(coin)),
            None => {
                warn!(%id, %coin, "subscribe for unknown connection ignored");
                Err(DataError::UnknownConnection(id))
            }
        }
    }

    /// Remove a connection. Removing an absent connection is a no-op.
    pub fn unregister(&self, id: ConnectionId) {
        if self.connections.write().remove(&id).is_some() {
            debug!(%id, "unregistered connection");
        }
    }

    /// Send `frame` to every open connection.
    pub fn broadcast(&self, frame: &Frame) -> BroadcastReport {
        self.broadcast_filtered(frame, |_| true)
    }

    /// Send `frame` to every open connection whose subscriptions satisfy `predicate`.
    ///
    /// Connections that fail to accept the frame are removed once the pass completes.
    pub fn broadcast_filtered<P>(&self, frame: &Frame, predicate: P) -> BroadcastReport
    where
        P: Fn(&BTreeSet<CoinId>) -> bool,
    {
        let mut report = BroadcastReport::default();

        {
            let connections = self.connections.read();
            for (id, connection) in connections.iter() {
                if !predicate(&connection.subscriptions) {
                    continue;
                }
                match connection.sink.send(frame.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(SinkClosed) => {
                        warn!(
                            %id,
                            error = %DataError::ConnectionSendFailure(*id),
                            "dropping connection after failed broadcast"
                        );
                        report.removed.push(*id);
                    }
                }
            }
        }

        if !report.removed.is_empty() {
            let mut connections = self.connections.write();
            for id in &report.removed {
                connections.remove(id);
            }
        }

        report
    }

    /// Send `frame` to a single connection, removing it if the send fails.
    pub fn send_to(&self, id: ConnectionId, frame: Frame) -> Result<(), DataError> {
        let sink = self
            .connections
            .read()
            .get(&id)
            .map(|connection| Arc::clone(&connection.sink))
            .ok_or(DataError::UnknownConnection(id))?;

        sink.send(frame).map_err(|SinkClosed| {
            self.unregister(id);
            DataError::ConnectionSendFailure(id)
        })
    }

    pub fn state(&self, id: ConnectionId) -> ConnectionState {
        if self.connections.read().contains_key(&id) {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    pub fn subscriptions(&self, id: ConnectionId) -> Option<BTreeSet<CoinId>> {
        self.connections
            .read()
            .get(&id)
            .map(|connection| connection.subscriptions.clone())
    }

    /// Union of every open connection's subscriptions.
    pub fn subscribed_coins(&self) -> BTreeSet<CoinId> {
        self.connections
            .read()
            .values()
            .flat_map(|connection| connection.subscriptions.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}
