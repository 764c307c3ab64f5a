//! DXLink wire codec
//!
//! JSON control and data messages exchanged with the feed service. The
//! `type` field drives dispatch; FEED_DATA payloads arrive either in the
//! COMPACT encoding (flat positional arrays, one record every N scalars) or
//! the FULL encoding (keyed objects), and both decode to the same
//! [`FeedEvent`] representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::dxlink::types::{base_symbol, Candle, Subscription, Tick, Timeframe};

/// Protocol version sent in the client SETUP message.
pub const PROTOCOL_VERSION: &str = "0.1-DXF-JS/0.3.0";

/// Control channel id for session-level messages.
pub const CONTROL_CHANNEL: u64 = 0;

/// Service name requested when opening a feed channel.
pub const FEED_SERVICE: &str = "FEED";

/// Compact field order declared in FEED_SETUP for Quote events.
pub const QUOTE_FIELDS: [&str; 5] = ["eventSymbol", "bidPrice", "askPrice", "bidSize", "askSize"];

/// Compact field order declared in FEED_SETUP for Trade events.
pub const TRADE_FIELDS: [&str; 4] = ["eventSymbol", "price", "size", "time"];

/// Compact field order declared in FEED_SETUP for Candle events.
pub const CANDLE_FIELDS: [&str; 8] = [
    "eventSymbol",
    "time",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "eventFlags",
];

/// Transaction-pending bit in a candle's eventFlags: while set, more data
/// belonging to the same snapshot transaction is still arriving.
pub const TX_PENDING: i64 = 1;

/// A DXLink control or data message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "SETUP")]
    Setup {
        channel: u64,
        version: String,
        #[serde(rename = "keepaliveTimeout")]
        keepalive_timeout: u64,
        #[serde(
            rename = "acceptKeepaliveTimeout",
            skip_serializing_if = "Option::is_none"
        )]
        accept_keepalive_timeout: Option<u64>,
    },
    #[serde(rename = "AUTH")]
    Auth { channel: u64, token: String },
    #[serde(rename = "AUTH_STATE")]
    AuthState {
        #[serde(default)]
        channel: u64,
        state: String,
    },
    #[serde(rename = "CHANNEL_REQUEST")]
    ChannelRequest {
        channel: u64,
        service: String,
        parameters: Value,
    },
    #[serde(rename = "CHANNEL_OPENED")]
    ChannelOpened {
        channel: u64,
        #[serde(default)]
        service: String,
    },
    #[serde(rename = "FEED_SETUP")]
    FeedSetup {
        channel: u64,
        #[serde(rename = "acceptDataFormat")]
        accept_data_format: String,
        #[serde(rename = "acceptEventFields")]
        accept_event_fields: Value,
    },
    #[serde(rename = "FEED_CONFIG")]
    FeedConfig {
        channel: u64,
        #[serde(rename = "dataFormat", default)]
        data_format: String,
    },
    #[serde(rename = "FEED_SUBSCRIPTION")]
    FeedSubscription {
        channel: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        add: Option<Vec<SubscriptionEntry>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        remove: Option<Vec<SubscriptionEntry>>,
    },
    #[serde(rename = "FEED_DATA")]
    FeedData { channel: u64, data: Value },
    #[serde(rename = "KEEPALIVE")]
    Keepalive {
        #[serde(default)]
        channel: u64,
    },
    #[serde(rename = "ERROR")]
    Error {
        #[serde(default)]
        error: String,
        #[serde(default)]
        message: String,
    },
    /// Any message type this client does not act on.
    #[serde(other)]
    Unknown,
}

/// One add/remove entry inside a FEED_SUBSCRIPTION message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionEntry {
    #[serde(rename = "type")]
    pub event_type: String,
    pub symbol: String,
    #[serde(rename = "fromTime", skip_serializing_if = "Option::is_none")]
    pub from_time: Option<i64>,
}

impl From<&Subscription> for SubscriptionEntry {
    fn from(sub: &Subscription) -> Self {
        Self {
            event_type: sub.kind.wire_name().to_string(),
            symbol: sub.symbol.clone(),
            from_time: sub.from_time,
        }
    }
}

impl WireMessage {
    /// Client-initiated SETUP for the control channel.
    pub fn setup(keepalive_timeout_secs: u64) -> Self {
        WireMessage::Setup {
            channel: CONTROL_CHANNEL,
            version: PROTOCOL_VERSION.to_string(),
            keepalive_timeout: keepalive_timeout_secs,
            accept_keepalive_timeout: Some(keepalive_timeout_secs),
        }
    }

    pub fn auth(token: &str) -> Self {
        WireMessage::Auth {
            channel: CONTROL_CHANNEL,
            token: token.to_string(),
        }
    }

    pub fn channel_request(channel: u64) -> Self {
        WireMessage::ChannelRequest {
            channel,
            service: FEED_SERVICE.to_string(),
            parameters: json!({ "contract": "AUTO" }),
        }
    }

    /// FEED_SETUP declaring the COMPACT format and the accepted field order
    /// for each event type this client decodes.
    pub fn feed_setup(channel: u64) -> Self {
        WireMessage::FeedSetup {
            channel,
            accept_data_format: "COMPACT".to_string(),
            accept_event_fields: json!({
                "Quote": QUOTE_FIELDS,
                "Trade": TRADE_FIELDS,
                "Candle": CANDLE_FIELDS,
            }),
        }
    }

    pub fn subscription_add(channel: u64, subs: &[Subscription]) -> Self {
        WireMessage::FeedSubscription {
            channel,
            add: Some(subs.iter().map(SubscriptionEntry::from).collect()),
            remove: None,
        }
    }

    pub fn subscription_remove(channel: u64, subs: &[Subscription]) -> Self {
        WireMessage::FeedSubscription {
            channel,
            add: None,
            remove: Some(subs.iter().map(SubscriptionEntry::from).collect()),
        }
    }

    pub fn keepalive() -> Self {
        WireMessage::Keepalive {
            channel: CONTROL_CHANNEL,
        }
    }
}

/// Decodes one inbound frame.
pub fn decode(text: &str) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Encodes one outbound message.
pub fn encode(message: &WireMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// A decoded market-data event from a FEED_DATA payload.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Quote(QuoteEvent),
    Trade(TradeEvent),
    Candle(CandleEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuoteEvent {
    pub symbol: String,
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
    pub bid_size: Option<f64>,
    pub ask_size: Option<f64>,
}

impl QuoteEvent {
    pub fn into_tick(self) -> Tick {
        Tick {
            symbol: self.symbol,
            bid: self.bid_price,
            ask: self.ask_price,
            last_price: None,
            volume: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeEvent {
    pub symbol: String,
    pub price: Option<f64>,
    pub size: Option<f64>,
    pub time: i64,
}

impl TradeEvent {
    pub fn into_tick(self) -> Tick {
        let timestamp = DateTime::<Utc>::from_timestamp_millis(self.time)
            .filter(|_| self.time > 0)
            .unwrap_or_else(Utc::now);
        Tick {
            symbol: self.symbol,
            bid: None,
            ask: None,
            last_price: self.price,
            volume: self.size,
            timestamp,
        }
    }
}

/// One candle record, with the raw (suffixed) symbol and the eventFlags bits.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleEvent {
    pub symbol: String,
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub event_flags: i64,
}

impl CandleEvent {
    /// Whether more data for the same snapshot transaction is still arriving.
    pub fn tx_pending(&self) -> bool {
        self.event_flags & TX_PENDING != 0
    }

    /// Symbol with the `{=tf}` suffix stripped.
    pub fn base_symbol(&self) -> &str {
        base_symbol(&self.symbol)
    }

    /// Timeframe recovered from the `{=tf}` suffix, when present and known.
    pub fn timeframe(&self) -> Option<Timeframe> {
        let start = self.symbol.find("{=")? + 2;
        let end = self.symbol[start..].find('}')? + start;
        self.symbol[start..end].parse().ok()
    }

    /// Converts to a domain candle under the given timeframe, normalizing
    /// the symbol to its base form.
    pub fn into_candle(self, timeframe: Timeframe) -> Candle {
        let symbol = self.base_symbol().to_string();
        Candle {
            symbol,
            timeframe,
            timestamp: DateTime::<Utc>::from_timestamp_millis(self.time).unwrap_or_default(),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// Decodes a FEED_DATA payload into events.
///
/// COMPACT payloads interleave event-type markers with flat value arrays,
/// each holding one or more records of fixed width. FULL payloads are arrays
/// of keyed objects carrying an `eventType` field. Records that cannot be
/// decoded are skipped with a warning rather than failing the whole frame.
pub fn decode_feed_data(data: &Value) -> Vec<FeedEvent> {
    let mut events = Vec::new();
    let Some(items) = data.as_array() else {
        warn!("FEED_DATA payload is not an array");
        return events;
    };

    let mut i = 0;
    while i < items.len() {
        match &items[i] {
            Value::String(event_type) => {
                if let Some(values) = items.get(i + 1).and_then(Value::as_array) {
                    decode_compact_records(event_type, values, &mut events);
                    i += 2;
                } else {
                    warn!(event_type = %event_type, "Compact event marker without value array");
                    i += 1;
                }
            }
            Value::Object(_) => {
                if let Some(event) = decode_keyed_record(&items[i]) {
                    events.push(event);
                }
                i += 1;
            }
            other => {
                warn!(item = %other, "Unexpected FEED_DATA item");
                i += 1;
            }
        }
    }

    events
}

/// Splits one flat value array into fixed-width records of `event_type`.
fn decode_compact_records(event_type: &str, values: &[Value], events: &mut Vec<FeedEvent>) {
    let width = match event_type {
        "Quote" => QUOTE_FIELDS.len(),
        "Trade" => TRADE_FIELDS.len(),
        "Candle" => CANDLE_FIELDS.len(),
        other => {
            warn!(event_type = %other, "Skipping compact records of unknown type");
            return;
        }
    };

    for record in values.chunks(width) {
        if record.len() < width {
            warn!(
                event_type = %event_type,
                got = record.len(),
                expected = width,
                "Truncated compact record"
            );
            break;
        }
        let event = match event_type {
            "Quote" => FeedEvent::Quote(QuoteEvent {
                symbol: as_string(&record[0]),
                bid_price: as_f64_opt(&record[1]),
                ask_price: as_f64_opt(&record[2]),
                bid_size: as_f64_opt(&record[3]),
                ask_size: as_f64_opt(&record[4]),
            }),
            "Trade" => FeedEvent::Trade(TradeEvent {
                symbol: as_string(&record[0]),
                price: as_f64_opt(&record[1]),
                size: as_f64_opt(&record[2]),
                time: as_i64(&record[3]),
            }),
            "Candle" => FeedEvent::Candle(CandleEvent {
                symbol: as_string(&record[0]),
                time: as_i64(&record[1]),
                open: as_f64(&record[2]),
                high: as_f64(&record[3]),
                low: as_f64(&record[4]),
                close: as_f64(&record[5]),
                volume: as_f64(&record[6]),
                event_flags: as_i64(&record[7]),
            }),
            _ => unreachable!(),
        };
        events.push(event);
    }
}

/// Decodes one keyed (FULL format) event object.
fn decode_keyed_record(item: &Value) -> Option<FeedEvent> {
    let event_type = item.get("eventType").and_then(Value::as_str)?;
    let symbol = item.get("eventSymbol").and_then(Value::as_str)?.to_string();

    let field = |name: &str| item.get(name).cloned().unwrap_or(Value::Null);

    match event_type {
        "Quote" => Some(FeedEvent::Quote(QuoteEvent {
            symbol,
            bid_price: as_f64_opt(&field("bidPrice")),
            ask_price: as_f64_opt(&field("askPrice")),
            bid_size: as_f64_opt(&field("bidSize")),
            ask_size: as_f64_opt(&field("askSize")),
        })),
        "Trade" => Some(FeedEvent::Trade(TradeEvent {
            symbol,
            price: as_f64_opt(&field("price")),
            size: as_f64_opt(&field("size")),
            time: as_i64(&field("time")),
        })),
        "Candle" => Some(FeedEvent::Candle(CandleEvent {
            symbol,
            time: as_i64(&field("time")),
            open: as_f64(&field("open")),
            high: as_f64(&field("high")),
            low: as_f64(&field("low")),
            close: as_f64(&field("close")),
            volume: as_f64(&field("volume")),
            event_flags: as_i64(&field("eventFlags")),
        })),
        other => {
            warn!(event_type = %other, "Skipping keyed record of unknown type");
            None
        }
    }
}

fn as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numeric field that may arrive as a JSON number or a string ("NaN").
fn as_f64(value: &Value) -> f64 {
    as_f64_opt(value).unwrap_or(f64::NAN)
}

fn as_f64_opt(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}
