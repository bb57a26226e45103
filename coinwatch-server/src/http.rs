use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use coinwatch_data::{
    error::DataError,
    model::{CoinHistory, CoinId, MarketSnapshot, TrendingCoin},
    reader::{DEFAULT_HISTORY_DAYS, MarketReader},
    refresh::{RefreshLoop, RefreshPhase},
    registry::ConnectionRegistry,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct AppState {
    pub reader: Arc<MarketReader>,
    pub registry: Arc<ConnectionRegistry>,
    pub refresh: Arc<RefreshLoop>,
}

pub fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/market-data", get(market_data))
        .route("/trending", get(trending))
        .route("/coin-price/{coin_id}", get(coin_price));

    Router::new()
        .nest("/api", api_routes)
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the REST API until `shutdown` changes.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP API listening on http://{}", addr);
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            info!("HTTP API shutting down");
        })
        .await
}

/// REST edge wrapper mapping a [`DataError`] to a JSON error response.
#[derive(Debug)]
pub struct ApiError(DataError);

impl From<DataError> for ApiError {
    fn from(error: DataError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            DataError::UpstreamRateLimited => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            DataError::UpstreamTimeout => (StatusCode::GATEWAY_TIMEOUT, "UPSTREAM_TIMEOUT"),
            DataError::UpstreamMalformedResponse(_) | DataError::Upstream(_) => {
                (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR")
            }
            DataError::CoinNotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            DataError::ConnectionSendFailure(_)
            | DataError::UnknownConnection(_)
            | DataError::SubscriptionLimit(_)
            | DataError::Serialise(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        if status.is_server_error() {
            warn!(error = %self.0, %status, "request failed");
        }

        let body = Json(json!({
            "error": code,
            "message": self.0.to_string(),
        }));

        (status, body).into_response()
    }
}

async fn market_data(State(state): State<AppState>) -> Result<Json<MarketSnapshot>, ApiError> {
    let snapshot = state.reader.market_overview().await?;
    Ok(Json(MarketSnapshot::clone(&snapshot)))
}

#[derive(Debug, Serialize)]
struct TrendingResponse {
    trending: Vec<TrendingCoin>,
}

async fn trending(State(state): State<AppState>) -> Result<Json<TrendingResponse>, ApiError> {
    let trending = state.reader.trending().await?;
    Ok(Json(TrendingResponse { trending }))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    days: Option<u32>,
}

async fn coin_price(
    State(state): State<AppState>,
    Path(coin_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<CoinHistory>, ApiError> {
    let coin = CoinId::new(coin_id);
    if !coin.is_valid() {
        return Err(DataError::CoinNotFound(coin).into());
    }

    let days = params.days.unwrap_or(DEFAULT_HISTORY_DAYS);
    let history = state.reader.coin_history(&coin, days).await?;
    Ok(Json(CoinHistory::clone(&history)))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    refresh_phase: RefreshPhase,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.registry.len(),
        refresh_phase: state.refresh.phase(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{StaticSource, refresh_loop};
    use axum::{body::Body, http::Request};
    use coinwatch_data::{
        cache::DEFAULT_CACHE_TTL,
        reader::HistoryCache,
        refresh::{DEFAULT_COINS, SnapshotCache},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(source: StaticSource) -> Router {
        let registry = Arc::new(ConnectionRegistry::new());
        let source = Arc::new(source);
        let reader = MarketReader::new(
            source.clone(),
            Arc::new(SnapshotCache::new(DEFAULT_CACHE_TTL)),
            Arc::new(HistoryCache::new(DEFAULT_CACHE_TTL)),
            DEFAULT_COINS.into_iter().map(CoinId::new).collect(),
        )
        .with_registry(registry.clone());

        router(AppState {
            reader: Arc::new(reader),
            registry: registry.clone(),
            refresh: refresh_loop(source, &registry),
        })
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_market_data() {
        let (status, body) = get(app(StaticSource::default()), "/api/market-data").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["coins"][0]["id"], "bitcoin");
        assert_eq!(body["global"]["btc_dominance"], 52.3);
        assert_eq!(body["trending"][0]["id"], "pepe");
    }

    #[tokio::test]
    async fn test_trending() {
        let (status, body) = get(app(StaticSource::default()), "/api/trending").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["trending"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn test_coin_price_days() {
        struct TestCase {
            uri: &'static str,
            expected_days: u64,
        }

        let tests = vec![
            TestCase {
                // TC0: default window
                uri: "/api/coin-price/bitcoin",
                expected_days: 7,
            },
            TestCase {
                // TC1: explicit window
                uri: "/api/coin-price/ethereum?days=30",
                expected_days: 30,
            },
            TestCase {
                // TC2: window is capped
                uri: "/api/coin-price/ethereum?days=9999",
                expected_days: 365,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let (status, body) = get(app(StaticSource::default()), test.uri).await;
            assert_eq!(status, StatusCode::OK, "TC{} failed", index);
            assert_eq!(body["days"], test.expected_days, "TC{} failed", index);
        }
    }

    #[tokio::test]
    async fn test_coin_price_rejects_malformed_ids() {
        struct TestCase {
            uri: &'static str,
        }

        let tests = vec![
            TestCase {
                // TC0: encoded path traversal
                uri: "/api/coin-price/..%2F..%2Fglobal",
            },
            TestCase {
                // TC1: encoded query delimiter
                uri: "/api/coin-price/bitcoin%3Fvs_currency=eur",
            },
            TestCase {
                // TC2: encoded fragment delimiter
                uri: "/api/coin-price/a%23b?days=30",
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let (status, body) = get(app(StaticSource::default()), test.uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "TC{} failed", index);
            assert_eq!(body["error"], "NOT_FOUND", "TC{} failed", index);
        }
    }

    #[tokio::test]
    async fn test_error_responses() {
        struct TestCase {
            error: DataError,
            uri: &'static str,
            expected_status: StatusCode,
            expected_code: &'static str,
        }

        let tests = vec![
            TestCase {
                // TC0: unknown coin
                error: DataError::CoinNotFound(CoinId::new("notacoin")),
                uri: "/api/coin-price/notacoin",
                expected_status: StatusCode::NOT_FOUND,
                expected_code: "NOT_FOUND",
            },
            TestCase {
                // TC1: rate limited
                error: DataError::UpstreamRateLimited,
                uri: "/api/market-data",
                expected_status: StatusCode::TOO_MANY_REQUESTS,
                expected_code: "RATE_LIMITED",
            },
            TestCase {
                // TC2: timeout
                error: DataError::UpstreamTimeout,
                uri: "/api/trending",
                expected_status: StatusCode::GATEWAY_TIMEOUT,
                expected_code: "UPSTREAM_TIMEOUT",
            },
            TestCase {
                // TC3: malformed upstream payload
                error: DataError::UpstreamMalformedResponse("missing field".to_string()),
                uri: "/api/market-data",
                expected_status: StatusCode::BAD_GATEWAY,
                expected_code: "UPSTREAM_ERROR",
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let (status, body) = get(app(StaticSource::failing(test.error)), test.uri).await;
            assert_eq!(status, test.expected_status, "TC{} failed", index);
            assert_eq!(body["error"], test.expected_code, "TC{} failed", index);
            assert!(body["message"].is_string(), "TC{} failed", index);
        }
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get(app(StaticSource::default()), "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["refresh_phase"], "idle");
    }
}
