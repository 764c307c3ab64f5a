//! Core data types for the DXLink feed
//!
//! Candles, ticks, timeframes and subscription descriptors shared by the
//! protocol client and the history coordinator.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Candle timeframe supported by the feed.
///
/// Each timeframe has a fixed duration, a human label ("5m") and the bracketed
/// suffix DXLink appends to candle symbols ("{=5m}").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    D1,
    W1,
    Mo1,
}

impl Timeframe {
    /// Human-readable label, also used in cache keys.
    pub fn label(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
            Timeframe::Mo1 => "1mo",
        }
    }

    /// The `{=tf}` suffix DXLink expects on candle subscription symbols.
    pub fn symbol_suffix(&self) -> String {
        format!("{{={}}}", self.label())
    }

    /// Fixed duration of one bar at this timeframe.
    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::minutes(1),
            Timeframe::M5 => Duration::minutes(5),
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::M30 => Duration::minutes(30),
            Timeframe::H1 => Duration::hours(1),
            Timeframe::D1 => Duration::days(1),
            Timeframe::W1 => Duration::days(7),
            Timeframe::Mo1 => Duration::days(30),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "1d" => Ok(Timeframe::D1),
            "1w" => Ok(Timeframe::W1),
            "1mo" => Ok(Timeframe::Mo1),
            other => Err(format!("Unknown timeframe: {}", other)),
        }
    }
}

/// One OHLCV bar.
///
/// Identity for dedup purposes is (symbol, timeframe, timestamp); a repeated
/// identity replaces the previous values rather than duplicating the entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Transient market-data update produced by quote and trade events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last_price: Option<f64>,
    pub volume: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Kind of feed event a subscription covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeedKind {
    Quote,
    Trade,
    Candle,
}

impl FeedKind {
    /// Event type name on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            FeedKind::Quote => "Quote",
            FeedKind::Trade => "Trade",
            FeedKind::Candle => "Candle",
        }
    }
}

/// One active subscription on a channel.
///
/// For candles the symbol carries the `{=tf}` suffix and `from_time` bounds
/// the history the feed replays.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub symbol: String,
    pub kind: FeedKind,
    pub from_time: Option<i64>,
}

impl Subscription {
    pub fn quote(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            kind: FeedKind::Quote,
            from_time: None,
        }
    }

    pub fn trade(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            kind: FeedKind::Trade,
            from_time: None,
        }
    }

    pub fn candle(base_symbol: &str, timeframe: Timeframe, from_time: i64) -> Self {
        Self {
            symbol: format!("{}{}", base_symbol, timeframe.symbol_suffix()),
            kind: FeedKind::Candle,
            from_time: Some(from_time),
        }
    }
}

/// Connection lifecycle state, transitioned only by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingAuth,
    Authenticated,
    Ready,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingAuth => "awaiting_auth",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Ready => "ready",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Read-only diagnostic snapshot of the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub channel_count: usize,
    pub subscription_count: usize,
    pub reconnect_attempts: u32,
}

/// Strips the `{=tf}` suffix from a candle event symbol.
pub fn base_symbol(symbol: &str) -> &str {
    match symbol.find('{') {
        Some(idx) => &symbol[..idx],
        None => symbol,
    }
}
