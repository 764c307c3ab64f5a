//! DXLink streaming protocol client
//!
//! One authenticated WebSocket session to the exchange feed, multiplexed
//! into logical channels. `protocol` is the wire codec, `channel` one
//! logical feed channel, `connection` the session owner with keepalive,
//! health checks and reconnection.

pub mod channel;
pub mod connection;
pub mod protocol;
pub mod types;

pub use channel::{ChannelState, StreamChannel};
pub use connection::ConnectionManager;
pub use types::{Candle, ConnectionState, ConnectionStats, FeedKind, Subscription, Tick, Timeframe};
