//! Batched historical candle retrieval over the live stream
//!
//! The feed has no bulk-history endpoint for candles; a point-in-time
//! snapshot is obtained by subscribing a candle stream with a fromTime in
//! the past and collecting the replayed bars. The coordinator borrows the
//! channel's candle pipe for the duration of one batch, deduplicates and
//! orders what arrives, and decides when the snapshot is complete.
//!
//! Completion has no authoritative end-of-data signal; the wait ends on the
//! first of three conditions, evaluated at a fixed poll cadence:
//! the last event had its tx-pending bit clear, no new events arrived for a
//! configured number of consecutive polls, or an absolute ceiling elapsed.
//! The heuristic can both over- and under-wait; results are best effort.
//!
//! Batch fetches are serialized behind one lock because the candle pipe has
//! a single borrower: concurrent callers queue rather than interleave. This
//! caps throughput at one live snapshot at a time, which is acceptable for
//! the request rates this provider serves.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::dxlink::connection::ConnectionManager;
use crate::dxlink::protocol::CandleEvent;
use crate::dxlink::types::{Candle, Subscription, Timeframe};
use crate::error::Result;
use crate::history::cache::ResultCache;

/// The slice of the streaming client a batch fetch needs. Implemented by
/// [`ConnectionManager`]; tests substitute a mock feed.
#[async_trait]
pub trait CandleFeed: Send + Sync {
    /// Brings the connection to ready state, reconnecting synchronously if
    /// needed.
    async fn ensure_ready(&self) -> Result<()>;

    /// Redirects candle events to `collector` until restored.
    async fn install_candle_collector(&self, collector: mpsc::UnboundedSender<CandleEvent>);

    /// Restores the default candle path.
    async fn restore_candle_handler(&self);

    async fn subscribe_candles(&self, subs: Vec<Subscription>) -> Result<()>;

    async fn unsubscribe_candles(&self, subs: Vec<Subscription>) -> Result<()>;
}

#[async_trait]
impl CandleFeed for ConnectionManager {
    async fn ensure_ready(&self) -> Result<()> {
        if self.is_connected().await {
            return Ok(());
        }
        info!("Feed not ready, connecting before batch fetch");
        self.connect().await
    }

    async fn install_candle_collector(&self, collector: mpsc::UnboundedSender<CandleEvent>) {
        ConnectionManager::install_candle_collector(self, collector).await;
    }

    async fn restore_candle_handler(&self) {
        ConnectionManager::restore_candle_handler(self).await;
    }

    async fn subscribe_candles(&self, subs: Vec<Subscription>) -> Result<()> {
        ConnectionManager::subscribe_candles(self, subs).await
    }

    async fn unsubscribe_candles(&self, subs: Vec<Subscription>) -> Result<()> {
        ConnectionManager::unsubscribe_candles(self, subs).await
    }
}

/// Coordinates point-in-time historical candle snapshots across one or many
/// symbols, guarded by a short-TTL result cache and a serialization lock.
pub struct CandleBatchCoordinator<F: CandleFeed> {
    feed: F,
    cache: ResultCache,
    config: StreamConfig,
    fetch_lock: Mutex<()>,
}

impl<F: CandleFeed> CandleBatchCoordinator<F> {
    pub fn new(feed: F, config: StreamConfig) -> Self {
        let cache = ResultCache::new(config.cache_ttl);
        Self {
            feed,
            cache,
            config,
            fetch_lock: Mutex::new(()),
        }
    }

    /// Most recent `bars` completed candles for one symbol, ascending by
    /// timestamp. Degrades to an empty list when the feed is unavailable.
    pub async fn get_candles(&self, symbol: &str, timeframe: Timeframe, bars: usize) -> Vec<Candle> {
        let mut results = self
            .get_candles_batch(&[symbol.to_string()], timeframe, bars)
            .await;
        results.remove(symbol).unwrap_or_default()
    }

    /// Batched snapshot across `symbols`; see [`fetch_batch`](Self::fetch_batch).
    pub async fn get_candles_batch(
        &self,
        symbols: &[String],
        timeframe: Timeframe,
        bars: usize,
    ) -> HashMap<String, Vec<Candle>> {
        self.fetch_batch(symbols, timeframe, bars, CancellationToken::new())
            .await
    }

    /// Batched snapshot with caller-controlled cancellation. On cancel, the
    /// bars already accumulated are still sorted, cached and returned.
    pub async fn fetch_batch(
        &self,
        symbols: &[String],
        timeframe: Timeframe,
        bars: usize,
        cancel: CancellationToken,
    ) -> HashMap<String, Vec<Candle>> {
        let mut results: HashMap<String, Vec<Candle>> = HashMap::new();
        let mut misses: Vec<String> = Vec::new();

        for symbol in symbols {
            if results.contains_key(symbol) || misses.contains(symbol) {
                continue;
            }
            match self.cache.get(symbol, timeframe, bars).await {
                Some(candles) => {
                    debug!(symbol = %symbol, count = candles.len(), "Batch cache hit");
                    results.insert(symbol.clone(), candles);
                }
                None => misses.push(symbol.clone()),
            }
        }
        if misses.is_empty() {
            return results;
        }

        // Only one batch may own the candle pipe at a time.
        let _borrow = self.fetch_lock.lock().await;

        if let Err(e) = self.feed.ensure_ready().await {
            warn!(error = %e, "Feed unavailable, batch degrades to empty results");
            for symbol in misses {
                results.entry(symbol).or_default();
            }
            return results;
        }

        let (collector_tx, collector_rx) = mpsc::unbounded_channel();
        self.feed.install_candle_collector(collector_tx).await;

        // Enough lookback to cover the window plus slack for incomplete
        // trailing bars.
        let lookback =
            timeframe.duration() * (bars + self.config.lookback_margin_bars as usize) as i32;
        let from_time = (Utc::now() - lookback).timestamp_millis();
        let subs: Vec<Subscription> = misses
            .iter()
            .map(|symbol| Subscription::candle(symbol, timeframe, from_time))
            .collect();
        info!(
            symbols = misses.len(),
            timeframe = %timeframe,
            bars,
            from_time,
            "Starting batch candle fetch"
        );
        if let Err(e) = self.feed.subscribe_candles(subs.clone()).await {
            warn!(error = %e, "Batch candle subscribe failed");
        }

        let accumulator = self
            .collect_until_complete(collector_rx, timeframe, &misses, &cancel)
            .await;

        if let Err(e) = self.feed.unsubscribe_candles(subs).await {
            warn!(error = %e, "Batch candle unsubscribe failed");
        }
        self.feed.restore_candle_handler().await;

        for (symbol, candles) in accumulator.finish(bars) {
            debug!(symbol = %symbol, count = candles.len(), "Batch symbol complete");
            self.cache
                .put(&symbol, timeframe, bars, candles.clone())
                .await;
            results.insert(symbol, candles);
        }
        results
    }

    /// Runs the three-way completion race over the collector pipe.
    async fn collect_until_complete(
        &self,
        mut collector_rx: mpsc::UnboundedReceiver<CandleEvent>,
        timeframe: Timeframe,
        symbols: &[String],
        cancel: &CancellationToken,
    ) -> BatchAccumulator {
        let mut accumulator = BatchAccumulator::new(timeframe, symbols);
        let ceiling = self.config.batch_ceiling(symbols.len());
        let deadline = tokio::time::sleep(ceiling);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(self.config.batch_poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            // Biased order: drain queued events before a poll tick judges
            // completion, and let cancellation or the ceiling win over both.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(events = accumulator.events, "Batch fetch cancelled, keeping partial results");
                    break;
                }
                _ = &mut deadline => {
                    debug!(events = accumulator.events, ceiling_secs = ceiling.as_secs(), "Batch ceiling elapsed");
                    break;
                }
                event = collector_rx.recv() => match event {
                    Some(event) => accumulator.record(event),
                    None => break,
                },
                _ = poll.tick() => {
                    if accumulator.poll(self.config.batch_stability_ticks) {
                        break;
                    }
                }
            }
        }
        accumulator
    }
}

/// Per-batch collection state: dedup by (symbol, timestamp), plus the
/// counters the completion heuristic reads.
struct BatchAccumulator {
    timeframe: Timeframe,
    per_symbol: HashMap<String, Vec<Candle>>,
    seen: HashSet<(String, i64)>,
    events: usize,
    last_tx_pending: bool,
    polled_events: usize,
    quiet_polls: u32,
}

impl BatchAccumulator {
    fn new(timeframe: Timeframe, symbols: &[String]) -> Self {
        let per_symbol = symbols
            .iter()
            .map(|symbol| (symbol.clone(), Vec::new()))
            .collect();
        Self {
            timeframe,
            per_symbol,
            seen: HashSet::new(),
            events: 0,
            last_tx_pending: true,
            polled_events: 0,
            quiet_polls: 0,
        }
    }

    /// Records one candle event: normalize the symbol, drop duplicates of an
    /// already-seen (symbol, timestamp) identity, ignore symbols this batch
    /// never asked for.
    fn record(&mut self, event: CandleEvent) {
        let base = event.base_symbol().to_string();
        if !self.per_symbol.contains_key(&base) {
            debug!(symbol = %event.symbol, "Dropping candle for symbol outside batch");
            return;
        }
        self.events += 1;
        self.last_tx_pending = event.tx_pending();
        if self.seen.insert((base.clone(), event.time)) {
            let candle = event.into_candle(self.timeframe);
            if let Some(list) = self.per_symbol.get_mut(&base) {
                list.push(candle);
            }
        }
    }

    /// One poll tick of the completion heuristic. True when the wait should
    /// end: snapshot-complete signal (last event not tx-pending) or no new
    /// events for `stability_ticks` consecutive polls, both requiring at
    /// least one event.
    fn poll(&mut self, stability_ticks: u32) -> bool {
        if self.events > 0 && !self.last_tx_pending {
            debug!(events = self.events, "Snapshot-complete signal observed");
            return true;
        }
        if self.events > 0 {
            if self.events == self.polled_events {
                self.quiet_polls += 1;
                if self.quiet_polls >= stability_ticks {
                    debug!(events = self.events, "No new candles, assuming snapshot complete");
                    return true;
                }
            } else {
                self.quiet_polls = 0;
            }
        }
        self.polled_events = self.events;
        false
    }

    /// Per symbol: ascending timestamp order, truncated to the most recent
    /// `bars` entries. Symbols with no data yield empty lists.
    fn finish(self, bars: usize) -> HashMap<String, Vec<Candle>> {
        self.per_symbol
            .into_iter()
            .map(|(symbol, mut candles)| {
                candles.sort_by_key(|c| c.timestamp);
                if candles.len() > bars {
                    candles.drain(..candles.len() - bars);
                }
                (symbol, candles)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(symbol: &str, time: i64, close: f64, flags: i64) -> CandleEvent {
        CandleEvent {
            symbol: symbol.to_string(),
            time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            event_flags: flags,
        }
    }

    #[test]
    fn accumulator_dedups_by_symbol_and_timestamp() {
        let symbols = vec!["AAPL".to_string()];
        let mut acc = BatchAccumulator::new(Timeframe::M5, &symbols);
        acc.record(event("AAPL{=5m}", 1_700_000_000_000, 1.0, 1));
        acc.record(event("AAPL{=5m}", 1_700_000_000_000, 1.0, 1));
        acc.record(event("AAPL{=5m}", 1_700_000_300_000, 2.0, 0));
        let results = acc.finish(100);
        assert_eq!(results["AAPL"].len(), 2);
    }

    #[test]
    fn accumulator_orders_ascending_and_truncates_to_most_recent() {
        let symbols = vec!["AAPL".to_string()];
        let mut acc = BatchAccumulator::new(Timeframe::M1, &symbols);
        // Out-of-order arrival.
        for i in [5i64, 1, 4, 2, 3, 0] {
            acc.record(event("AAPL{=1m}", 1_700_000_000_000 + i * 60_000, i as f64, 1));
        }
        let results = acc.finish(3);
        let candles = &results["AAPL"];
        assert_eq!(candles.len(), 3);
        assert!(candles.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        // Most recent three bars survive the truncation.
        assert_eq!(candles[0].close, 3.0);
        assert_eq!(candles[2].close, 5.0);
    }

    #[test]
    fn accumulator_ignores_symbols_outside_batch() {
        let symbols = vec!["AAPL".to_string()];
        let mut acc = BatchAccumulator::new(Timeframe::M5, &symbols);
        acc.record(event("TSLA{=5m}", 1_700_000_000_000, 1.0, 0));
        assert_eq!(acc.events, 0);
        assert_eq!(acc.finish(10)["AAPL"].len(), 0);
    }

    #[test]
    fn poll_completes_on_clear_tx_pending() {
        let symbols = vec!["AAPL".to_string()];
        let mut acc = BatchAccumulator::new(Timeframe::M5, &symbols);
        acc.record(event("AAPL{=5m}", 1_700_000_000_000, 1.0, 1));
        assert!(!acc.poll(3));
        acc.record(event("AAPL{=5m}", 1_700_000_300_000, 2.0, 0));
        assert!(acc.poll(3));
    }

    #[test]
    fn poll_completes_after_quiet_ticks() {
        let symbols = vec!["AAPL".to_string()];
        let mut acc = BatchAccumulator::new(Timeframe::M5, &symbols);
        acc.record(event("AAPL{=5m}", 1_700_000_000_000, 1.0, 1));
        assert!(!acc.poll(3));
        assert!(!acc.poll(3));
        assert!(!acc.poll(3));
        assert!(acc.poll(3));
    }

    #[test]
    fn poll_never_completes_with_no_events() {
        let symbols = vec!["AAPL".to_string()];
        let mut acc = BatchAccumulator::new(Timeframe::M5, &symbols);
        for _ in 0..20 {
            assert!(!acc.poll(3));
        }
    }
}
