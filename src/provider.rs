//! Market-data provider facade
//!
//! Wires the connection manager, the batch coordinator and the external
//! collaborators together and exposes the operational surface callers use:
//! candle retrieval, live tick subscriptions, connection stats and manual
//! reconnect. Transient transport trouble never surfaces from these calls;
//! callers see empty or partial data and can read the stats snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::StreamConfig;
use crate::dxlink::connection::ConnectionManager;
use crate::dxlink::types::{Candle, ConnectionStats, Timeframe};
use crate::error::Result;
use crate::history::CandleBatchCoordinator;
use crate::ports::{CandleSink, TickPublisher, TokenProvider};

pub struct MarketDataProvider {
    connection: ConnectionManager,
    coordinator: CandleBatchCoordinator<ConnectionManager>,
    pumps: Vec<JoinHandle<()>>,
}

impl MarketDataProvider {
    /// Builds the provider and starts the collaborator pumps. Must run
    /// inside a tokio runtime; nothing touches the network until
    /// [`start`](Self::start).
    pub fn new(
        config: StreamConfig,
        tokens: Arc<dyn TokenProvider>,
        ticks: Arc<dyn TickPublisher>,
        candles: Arc<dyn CandleSink>,
    ) -> Self {
        let (connection, mut tick_rx, mut candle_rx) =
            ConnectionManager::new(config.clone(), tokens);
        let coordinator = CandleBatchCoordinator::new(connection.clone(), config);

        let tick_pump = tokio::spawn(async move {
            while let Some(tick) = tick_rx.recv().await {
                debug!(symbol = %tick.symbol, "Publishing tick");
                ticks.publish_tick(tick).await;
            }
        });

        // Candles flowing outside a batch fetch go straight to persistence;
        // the timeframe is recovered from the symbol suffix.
        let candle_pump = tokio::spawn(async move {
            while let Some(event) = candle_rx.recv().await {
                match event.timeframe() {
                    Some(timeframe) => {
                        candles.save_candles(vec![event.into_candle(timeframe)]).await;
                    }
                    None => {
                        warn!(symbol = %event.symbol, "Candle without timeframe suffix, dropped")
                    }
                }
            }
        });

        Self {
            connection,
            coordinator,
            pumps: vec![tick_pump, candle_pump],
        }
    }

    /// Connects and completes the handshake. Fatal configuration problems
    /// (bad token, malformed URL) surface here; transient failures afterward
    /// are handled by the reconnection machine.
    pub async fn start(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Most recent `limit` candles for one symbol, ascending by timestamp.
    pub async fn get_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Vec<Candle> {
        self.coordinator.get_candles(symbol, timeframe, limit).await
    }

    /// Batched candle snapshot across symbols.
    pub async fn get_candles_batch(
        &self,
        symbols: &[String],
        timeframe: Timeframe,
        limit: usize,
    ) -> HashMap<String, Vec<Candle>> {
        self.coordinator
            .get_candles_batch(symbols, timeframe, limit)
            .await
    }

    /// Batched snapshot bounded by a caller-side cancellation token.
    pub async fn get_candles_batch_cancellable(
        &self,
        symbols: &[String],
        timeframe: Timeframe,
        limit: usize,
        cancel: CancellationToken,
    ) -> HashMap<String, Vec<Candle>> {
        self.coordinator
            .fetch_batch(symbols, timeframe, limit, cancel)
            .await
    }

    pub async fn subscribe(&self, symbol: &str) {
        self.connection.subscribe(symbol).await;
    }

    pub async fn unsubscribe(&self, symbol: &str) {
        self.connection.unsubscribe(symbol).await;
    }

    pub async fn stats(&self) -> ConnectionStats {
        self.connection.stats().await
    }

    pub fn force_reconnect(&self) {
        self.connection.force_reconnect();
    }

    /// Normal closure: disconnects, cancels scheduled work and stops the
    /// collaborator pumps.
    pub async fn shutdown(&self) {
        self.connection.disconnect().await;
        for pump in &self.pumps {
            pump.abort();
        }
    }
}
