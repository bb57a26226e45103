use crate::{model::CoinId, registry::ConnectionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `coinwatch-data`.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum DataError {
    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("upstream rate limit exceeded")]
    UpstreamRateLimited,

    #[error("upstream returned a malformed response: {0}")]
    UpstreamMalformedResponse(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("coin {0} not found")]
    CoinNotFound(CoinId),

    #[error("failed to send to connection {0}")]
    ConnectionSendFailure(ConnectionId),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("connection {0} reached its subscription limit")]
    SubscriptionLimit(ConnectionId),

    #[error("failed to serialise outbound message: {0}")]
    Serialise(String),
}

impl DataError {
    /// Determine if an error originated from the upstream
    /// [`MarketDataSource`](crate::source::MarketDataSource).
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_upstream(&self) -> bool {
        match self {
            DataError::UpstreamTimeout
            | DataError::UpstreamRateLimited
            | DataError::UpstreamMalformedResponse(_)
            | DataError::Upstream(_)
            | DataError::CoinNotFound(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for DataError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::UpstreamTimeout
        } else if error.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) {
            Self::UpstreamRateLimited
        } else if error.is_decode() {
            Self::UpstreamMalformedResponse(error.to_string())
        } else {
            Self::Upstream(error.to_string())
        }
    }
}

impl From<serde_json::Error> for DataError {
    fn from(error: serde_json::Error) -> Self {
        Self::UpstreamMalformedResponse(error.to_string())
    }
}
