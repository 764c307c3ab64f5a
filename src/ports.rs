//! Collaborator interfaces at the crate boundary
//!
//! The streaming core depends on three external collaborators: a token
//! provider (REST side of the exchange API), a tick publisher (message bus),
//! and a candle sink (persistence). They are traits here so the core can be
//! exercised without any of them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::dxlink::types::{Candle, Tick, Timeframe};
use crate::error::DxLinkError;

/// Fresh streaming credentials: an API quote token and the WebSocket URL it
/// is valid for.
#[derive(Debug, Clone)]
pub struct StreamCredentials {
    pub token: String,
    pub url: String,
}

/// Supplies streaming credentials at connect time and on every reconnect
/// attempt (tokens expire; a stale one yields an auth rejection).
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn stream_credentials(&self) -> Result<StreamCredentials, DxLinkError>;
}

/// Downstream consumer of live quote/trade ticks.
#[async_trait]
pub trait TickPublisher: Send + Sync {
    async fn publish_tick(&self, tick: Tick);
}

/// Downstream store for candles flowing outside a batch fetch.
#[async_trait]
pub trait CandleSink: Send + Sync {
    async fn save_candles(&self, candles: Vec<Candle>);

    /// Number of stored candles for the symbol and timeframe whose
    /// timestamps fall inside `[from, to]`. Lets callers check persisted
    /// coverage before reaching for the live stream.
    async fn count_in_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> usize;
}

/// Token provider backed by a fixed token and URL, for bring-up against a
/// pre-issued token and for tests.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    credentials: StreamCredentials,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            credentials: StreamCredentials {
                token: token.into(),
                url: url.into(),
            },
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn stream_credentials(&self) -> Result<StreamCredentials, DxLinkError> {
        Ok(self.credentials.clone())
    }
}
