//! Per-connection dispatch of inbound live messages.

use crate::{
    error::DataError,
    model::CoinId,
    protocol::{InboundMessage, OutboundMessage},
    refresh::RefreshLoop,
    registry::{ConnectionId, ConnectionRegistry, ConnectionSink},
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Greeting sent to every new connection.
pub const CONNECTED_STATUS: &str = "Connected to live price feed";

/// What [`Session::handle_text`] did with an inbound message.
#[derive(Debug)]
pub enum Dispatch {
    Subscribed {
        coin_id: CoinId,
        /// `false` if the connection was already subscribed.
        added: bool,
    },
    /// On-demand fetch running in the background.
    LivePrice(JoinHandle<()>),
    Ignored,
}

/// Live connection registered with a [`ConnectionRegistry`].
///
/// The connection is unregistered when the session is closed or dropped.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
    refresh: Arc<RefreshLoop>,
}

impl Session {
    /// Register `sink` and greet it with a `status` message.
    pub fn connect(
        registry: Arc<ConnectionRegistry>,
        refresh: Arc<RefreshLoop>,
        sink: Arc<dyn ConnectionSink>,
    ) -> Result<Self, DataError> {
        let id = registry.register(sink);
        let session = Self {
            id,
            registry,
            refresh,
        };

        let status = OutboundMessage::status(CONNECTED_STATUS).to_frame()?;
        session.registry.send_to(id, status)?;

        info!(%id, connections = session.registry.len(), "client connected");
        Ok(session)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Dispatch a single inbound text message.
    ///
    /// Malformed and unknown messages are logged and ignored.
    pub fn handle_text(&self, text: &str) -> Dispatch {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(error) => {
                debug!(id = %self.id, %error, payload = text, "ignoring unrecognised message");
                return Dispatch::Ignored;
            }
        };

        match message {
            InboundMessage::SubscribeToCoin { coin_id } => self.subscribe(coin_id),
            InboundMessage::GetLivePrice { coin_id } => {
                debug!(id = %self.id, %coin_id, "live price requested");
                let refresh = Arc::clone(&self.refresh);
                let id = self.id;
                Dispatch::LivePrice(tokio::spawn(async move {
                    if let Err(error) = refresh.live_price(id, coin_id).await {
                        debug!(%id, %error, "live price reply not delivered");
                    }
                }))
            }
        }
    }

    fn subscribe(&self, coin_id: CoinId) -> Dispatch {
        let coin_id = CoinId::new(coin_id.as_str());
        if !coin_id.is_valid() {
            debug!(id = %self.id, %coin_id, "ignoring subscribe to malformed coin id");
            return Dispatch::Ignored;
        }

        let added = match self.registry.subscribe(self.id, coin_id.clone()) {
            Ok(added) => added,
            Err(_) => return Dispatch::Ignored,
        };

        let confirmed = OutboundMessage::subscription_confirmed(coin_id.clone());
        match confirmed.to_frame() {
            Ok(frame) => {
                if let Err(error) = self.registry.send_to(self.id, frame) {
                    warn!(id = %self.id, %error, "failed to confirm subscription");
                }
            }
            Err(error) => warn!(id = %self.id, %error, "failed to serialise confirmation"),
        }

        debug!(id = %self.id, %coin_id, added, "subscribed");
        Dispatch::Subscribed { coin_id, added }
    }

    /// Unregister the connection.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
        info!(id = %self.id, connections = self.registry.len(), "client disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::DEFAULT_CACHE_TTL,
        model::SinglePrice,
        protocol::Frame,
        refresh::{RefreshConfig, SnapshotCache},
        registry::{ConnectionState, MAX_SUBSCRIPTIONS_PER_CONNECTION, tests::RecordingSink},
        source::tests::MockSource,
    };
    use serde_json::{Value, json};

    fn refresh(source: MockSource, registry: &Arc<ConnectionRegistry>) -> Arc<RefreshLoop> {
        Arc::new(RefreshLoop::new(
            Arc::new(source),
            Arc::new(SnapshotCache::new(DEFAULT_CACHE_TTL)),
            Arc::clone(registry),
            RefreshConfig::default(),
        ))
    }

    fn decode(frame: &Frame) -> Value {
        serde_json::from_str(frame.as_str()).unwrap()
    }

    #[test]
    fn test_connect_sends_status() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sink = Arc::new(RecordingSink::default());

        let session = Session::connect(
            registry.clone(),
            refresh(MockSource::default(), &registry),
            sink.clone(),
        )
        .unwrap();

        assert_eq!(registry.state(session.id()), ConnectionState::Open);
        assert_eq!(
            sink.received().iter().map(decode).collect::<Vec<_>>(),
            vec![json!({ "type": "status", "data": { "msg": "Connected to live price feed" } })]
        );
    }

    #[test]
    fn test_connect_with_dead_sink_fails_and_unregisters() {
        let registry = Arc::new(ConnectionRegistry::new());

        let actual = Session::connect(
            registry.clone(),
            refresh(MockSource::default(), &registry),
            Arc::new(RecordingSink::failing()),
        );

        assert!(matches!(actual, Err(DataError::ConnectionSendFailure(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handle_text_subscribe_to_coin() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let session = Session::connect(
            registry.clone(),
            refresh(MockSource::default(), &registry),
            sink.clone(),
        )
        .unwrap();

        let first = session.handle_text(r#"{"type":"subscribe_to_coin","data":{"coin_id":"bitcoin"}}"#);
        let second = session.handle_text(r#"{"type":"subscribe_to_coin","data":{"coin_id":"bitcoin"}}"#);

        assert!(matches!(first, Dispatch::Subscribed { added: true, .. }));
        assert!(matches!(second, Dispatch::Subscribed { added: false, .. }));
        assert_eq!(
            registry.subscriptions(session.id()),
            Some([CoinId::new("bitcoin")].into_iter().collect())
        );

        let frames = sink.received();
        assert_eq!(frames.len(), 3);
        assert_eq!(
            decode(&frames[1]),
            json!({ "type": "subscription_confirmed", "data": { "coin_id": "bitcoin" } })
        );
        assert_eq!(frames[1], frames[2]);
    }

    #[test]
    fn test_handle_text_ignores_malformed_messages() {
        struct TestCase {
            input: &'static str,
        }

        let tests = vec![
            TestCase {
                // TC0: not json
                input: "hello",
            },
            TestCase {
                // TC1: unknown type
                input: r#"{"type":"unsubscribe","data":{"coin_id":"bitcoin"}}"#,
            },
            TestCase {
                // TC2: missing data
                input: r#"{"type":"subscribe_to_coin"}"#,
            },
            TestCase {
                // TC3: wrong field type
                input: r#"{"type":"subscribe_to_coin","data":{"coin_id":7}}"#,
            },
        ];

        let registry = Arc::new(ConnectionRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let session = Session::connect(
            registry.clone(),
            refresh(MockSource::default(), &registry),
            sink.clone(),
        )
        .unwrap();

        for (index, test) in tests.into_iter().enumerate() {
            let actual = session.handle_text(test.input);
            assert!(matches!(actual, Dispatch::Ignored), "TC{} failed", index);
            assert_eq!(sink.received().len(), 1, "TC{} failed", index);
            assert_eq!(registry.state(session.id()), ConnectionState::Open);
        }
    }

    #[test]
    fn test_handle_text_rejects_unusable_subscriptions() {
        struct TestCase {
            input: String,
        }

        let subscribe = |coin_id: &str| {
            json!({ "type": "subscribe_to_coin", "data": { "coin_id": coin_id } }).to_string()
        };

        let tests = vec![
            TestCase {
                // TC0: path traversal
                input: subscribe("../../global"),
            },
            TestCase {
                // TC1: query delimiter
                input: subscribe("bitcoin?vs_currency=eur"),
            },
            TestCase {
                // TC2: blank
                input: subscribe("   "),
            },
            TestCase {
                // TC3: new coin once the connection is at its limit
                input: subscribe("dogecoin"),
            },
        ];

        let registry = Arc::new(ConnectionRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let session = Session::connect(
            registry.clone(),
            refresh(MockSource::default(), &registry),
            sink.clone(),
        )
        .unwrap();

        for n in 0..MAX_SUBSCRIPTIONS_PER_CONNECTION {
            let actual = session.handle_text(&subscribe(&format!("coin-{n}")));
            assert!(matches!(actual, Dispatch::Subscribed { added: true, .. }));
        }
        let frames_before = sink.received().len();

        for (index, test) in tests.into_iter().enumerate() {
            let actual = session.handle_text(&test.input);
            assert!(matches!(actual, Dispatch::Ignored), "TC{} failed", index);
            assert_eq!(sink.received().len(), frames_before, "TC{} failed", index);
        }

        assert_eq!(
            registry.subscriptions(session.id()).map(|coins| coins.len()),
            Some(MAX_SUBSCRIPTIONS_PER_CONNECTION)
        );
        assert_eq!(registry.state(session.id()), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_handle_text_get_live_price_defaults_to_bitcoin() {
        let registry = Arc::new(ConnectionRegistry::new());
        let source = MockSource::with_prices([Ok(SinglePrice {
            price: 64_000.0,
            change_24h: 1.2,
        })]);
        let sink = Arc::new(RecordingSink::default());
        let other = Arc::new(RecordingSink::default());
        let refresh = refresh(source, &registry);
        let session = Session::connect(registry.clone(), refresh.clone(), sink.clone()).unwrap();
        let _other = Session::connect(registry.clone(), refresh, other.clone()).unwrap();

        let Dispatch::LivePrice(handle) = session.handle_text(r#"{"type":"get_live_price","data":{}}"#)
        else {
            panic!("expected live price dispatch");
        };
        handle.await.unwrap();

        let frames = sink.received();
        assert_eq!(frames.len(), 2);
        let reply = decode(&frames[1]);
        assert_eq!(reply["type"], json!("live_price_response"));
        assert_eq!(reply["data"]["coin_id"], json!("bitcoin"));
        assert_eq!(reply["data"]["price"], json!(64_000.0));
        assert_eq!(other.received().len(), 1);
    }

    #[test]
    fn test_close_and_drop_unregister() {
        let registry = Arc::new(ConnectionRegistry::new());
        let refresh = refresh(MockSource::default(), &registry);

        let closed = Session::connect(
            registry.clone(),
            refresh.clone(),
            Arc::new(RecordingSink::default()),
        )
        .unwrap();
        let closed_id = closed.id();
        closed.close();
        assert_eq!(registry.state(closed_id), ConnectionState::Closed);

        let dropped_id = {
            let session =
                Session::connect(registry.clone(), refresh, Arc::new(RecordingSink::default()))
                    .unwrap();
            session.handle_text(r#"{"type":"subscribe_to_coin","data":{"coin_id":"solana"}}"#);
            session.id()
        };
        assert_eq!(registry.state(dropped_id), ConnectionState::Closed);
        assert!(registry.subscribed_coins().is_empty());
    }
}
