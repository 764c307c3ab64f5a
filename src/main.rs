use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dxlink_provider::config::StreamConfig;
use dxlink_provider::dxlink::types::{Candle, Tick, Timeframe};
use dxlink_provider::ports::{CandleSink, StaticTokenProvider, TickPublisher};
use dxlink_provider::MarketDataProvider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    // Misconfiguration at bring-up is fatal; everything after start() is
    // handled by the reconnection machine.
    let config = StreamConfig::from_env().map_err(anyhow::Error::msg)?;
    let url = std::env::var("DXLINK_URL").context("DXLINK_URL not set")?;
    let token = std::env::var("DXLINK_TOKEN").context("DXLINK_TOKEN not set")?;
    let symbols: Vec<String> = std::env::args().skip(1).collect();

    let tokens = Arc::new(StaticTokenProvider::new(token, url));
    let provider = MarketDataProvider::new(
        config,
        tokens,
        Arc::new(LogTickPublisher),
        Arc::new(LogCandleSink),
    );

    tracing::info!("Starting DXLink provider...");
    provider.start().await?;
    for symbol in &symbols {
        provider.subscribe(symbol).await;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    provider.shutdown().await;
    Ok(())
}

/// Demo publisher: logs ticks instead of forwarding them to a message bus.
struct LogTickPublisher;

#[async_trait]
impl TickPublisher for LogTickPublisher {
    async fn publish_tick(&self, tick: Tick) {
        tracing::info!(
            symbol = %tick.symbol,
            bid = ?tick.bid,
            ask = ?tick.ask,
            last = ?tick.last_price,
            "tick"
        );
    }
}

/// Demo sink: logs candles instead of persisting them.
struct LogCandleSink;

#[async_trait]
impl CandleSink for LogCandleSink {
    async fn save_candles(&self, candles: Vec<Candle>) {
        for candle in candles {
            tracing::info!(
                symbol = %candle.symbol,
                timeframe = %candle.timeframe,
                time = %candle.timestamp,
                open = candle.open,
                high = candle.high,
                low = candle.low,
                close = candle.close,
                volume = candle.volume,
                "candle"
            );
        }
    }

    // Nothing is persisted, so coverage is always zero.
    async fn count_in_range(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> usize {
        0
    }
}
