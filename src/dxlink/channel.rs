//! Multiplexed feed channel
//!
//! One logical channel riding on the shared socket. The channel tracks its
//! own open/ready state, owns its subscription set with idempotent add and
//! remove, and routes decoded events: quotes and trades to the always-on
//! tick pipe, candles to a swappable candle pipe that a batch fetch may
//! borrow for the duration of one snapshot.

use std::collections::HashSet;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::dxlink::connection::Outbound;
use crate::dxlink::protocol::{CandleEvent, FeedEvent, WireMessage};
use crate::dxlink::types::{Subscription, Tick};
use crate::error::{DxLinkError, Result};

/// Channel lifecycle: requested on the wire, opened by the server, ready
/// once the feed configuration round trip completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Requested,
    Opened,
    Ready,
}

/// One multiplexed logical channel on the shared connection.
pub struct StreamChannel {
    id: u64,
    state_tx: watch::Sender<ChannelState>,
    subscriptions: RwLock<HashSet<Subscription>>,
    outbound: Outbound,
    tick_tx: mpsc::UnboundedSender<Tick>,
    candle_tx: RwLock<mpsc::UnboundedSender<CandleEvent>>,
    default_candle_tx: mpsc::UnboundedSender<CandleEvent>,
}

impl StreamChannel {
    pub fn new(
        id: u64,
        outbound: Outbound,
        tick_tx: mpsc::UnboundedSender<Tick>,
        candle_tx: mpsc::UnboundedSender<CandleEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Requested);
        Self {
            id,
            state_tx,
            subscriptions: RwLock::new(HashSet::new()),
            outbound,
            tick_tx,
            candle_tx: RwLock::new(candle_tx.clone()),
            default_candle_tx: candle_tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    /// Sends the channel-open request for the feed service. The channel
    /// becomes ready asynchronously once CHANNEL_OPENED and FEED_CONFIG are
    /// both observed; use [`wait_ready`](Self::wait_ready) to block on that.
    pub async fn open(&self) -> Result<()> {
        self.outbound
            .send(&WireMessage::channel_request(self.id))
            .await
    }

    /// CHANNEL_OPENED observed: declare the accepted data format and fields.
    pub async fn handle_opened(&self) -> Result<()> {
        self.state_tx.send_replace(ChannelState::Opened);
        debug!(channel = self.id, "Channel opened, sending feed setup");
        self.outbound.send(&WireMessage::feed_setup(self.id)).await
    }

    /// FEED_CONFIG observed: the channel is fully configured.
    pub fn handle_config(&self, data_format: &str) {
        info!(channel = self.id, data_format = %data_format, "Feed channel ready");
        self.state_tx.send_replace(ChannelState::Ready);
    }

    /// Waits until the channel reaches ready state.
    pub async fn wait_ready(&self, wait: std::time::Duration) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        timeout(wait, rx.wait_for(|state| *state == ChannelState::Ready))
            .await
            .map_err(|_| {
                DxLinkError::ChannelOpen(format!(
                    "channel {} did not become ready within {:?}",
                    self.id, wait
                ))
            })?
            .map_err(|_| DxLinkError::ChannelOpen("channel state tracker dropped".to_string()))?;
        Ok(())
    }

    /// Adds subscriptions, emitting one batched add for the ones not already
    /// present. Re-adding an existing subscription is a no-op.
    pub async fn subscribe(&self, subs: Vec<Subscription>) -> Result<()> {
        let fresh: Vec<Subscription> = {
            let mut held = self.subscriptions.write().await;
            subs.into_iter().filter(|sub| held.insert(sub.clone())).collect()
        };
        if fresh.is_empty() {
            return Ok(());
        }
        debug!(channel = self.id, count = fresh.len(), "Adding subscriptions");
        self.outbound
            .send(&WireMessage::subscription_add(self.id, &fresh))
            .await
    }

    /// Removes subscriptions; absent ones are ignored.
    pub async fn unsubscribe(&self, subs: Vec<Subscription>) -> Result<()> {
        let present: Vec<Subscription> = {
            let mut held = self.subscriptions.write().await;
            subs.into_iter().filter(|sub| held.remove(sub)).collect()
        };
        if present.is_empty() {
            return Ok(());
        }
        debug!(channel = self.id, count = present.len(), "Removing subscriptions");
        self.outbound
            .send(&WireMessage::subscription_remove(self.id, &present))
            .await
    }

    /// Snapshot of the active subscription set.
    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.read().await.iter().cloned().collect()
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Drops all subscription bookkeeping without emitting wire messages;
    /// used on disconnect when the server side of the channel is gone.
    pub async fn invalidate(&self) {
        self.subscriptions.write().await.clear();
        self.state_tx.send_replace(ChannelState::Requested);
    }

    /// Routes decoded feed events to their handlers. Quote and trade events
    /// always flow to the tick pipe; candle events go to whichever candle
    /// pipe is currently installed.
    pub async fn dispatch(&self, events: Vec<FeedEvent>) {
        for event in events {
            match event {
                FeedEvent::Quote(quote) => self.forward_tick(quote.into_tick()),
                FeedEvent::Trade(trade) => self.forward_tick(trade.into_tick()),
                FeedEvent::Candle(candle) => {
                    let tx = self.candle_tx.read().await;
                    if tx.send(candle).is_err() {
                        warn!(channel = self.id, "Candle receiver dropped, event lost");
                    }
                }
            }
        }
    }

    fn forward_tick(&self, tick: Tick) {
        if self.tick_tx.send(tick).is_err() {
            debug!(channel = self.id, "Tick receiver dropped");
        }
    }

    /// Temporarily redirects candle events to `collector`. The caller must
    /// hold the batch-fetch lock so only one borrow is live at a time.
    pub async fn install_candle_collector(&self, collector: mpsc::UnboundedSender<CandleEvent>) {
        *self.candle_tx.write().await = collector;
    }

    /// Restores the default candle pipe after a batch fetch.
    pub async fn restore_candle_handler(&self) {
        *self.candle_tx.write().await = self.default_candle_tx.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dxlink::protocol::QuoteEvent;
    use crate::dxlink::types::Timeframe;

    fn test_channel() -> (
        StreamChannel,
        mpsc::UnboundedReceiver<Tick>,
        mpsc::UnboundedReceiver<CandleEvent>,
    ) {
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (candle_tx, candle_rx) = mpsc::unbounded_channel();
        let channel = StreamChannel::new(3, Outbound::detached(), tick_tx, candle_tx);
        (channel, tick_rx, candle_rx)
    }

    #[tokio::test]
    async fn duplicate_subscribe_is_a_noop() {
        let (channel, _tick_rx, _candle_rx) = test_channel();
        // The detached outbound rejects the first (real) add; the set is
        // still recorded so resubscription can replay it.
        assert!(channel
            .subscribe(vec![Subscription::quote("AAPL")])
            .await
            .is_err());
        // The duplicate never reaches the wire, so nothing fails.
        channel
            .subscribe(vec![Subscription::quote("AAPL")])
            .await
            .unwrap();
        assert_eq!(channel.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn unsubscribe_absent_is_a_noop() {
        let (channel, _tick_rx, _candle_rx) = test_channel();
        channel
            .unsubscribe(vec![Subscription::trade("AAPL")])
            .await
            .unwrap();
        assert_eq!(channel.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn resubscribing_full_set_after_invalidate_has_no_duplicates() {
        let (channel, _tick_rx, _candle_rx) = test_channel();
        let set = vec![
            Subscription::quote("AAPL"),
            Subscription::trade("AAPL"),
            Subscription::quote("MSFT"),
            Subscription::trade("MSFT"),
        ];
        let _ = channel.subscribe(set.clone()).await;
        channel.invalidate().await;
        assert_eq!(channel.subscription_count().await, 0);
        let _ = channel.subscribe(set).await;
        assert_eq!(channel.subscription_count().await, 4);
    }

    #[tokio::test]
    async fn quotes_flow_to_tick_pipe() {
        let (channel, mut tick_rx, _candle_rx) = test_channel();
        channel
            .dispatch(vec![FeedEvent::Quote(QuoteEvent {
                symbol: "AAPL".to_string(),
                bid_price: Some(185.0),
                ask_price: Some(185.1),
                bid_size: None,
                ask_size: None,
            })])
            .await;
        let tick = tick_rx.recv().await.unwrap();
        assert_eq!(tick.symbol, "AAPL");
        assert_eq!(tick.bid, Some(185.0));
    }

    #[tokio::test]
    async fn candle_collector_borrow_and_restore() {
        let (channel, _tick_rx, mut default_rx) = test_channel();
        let (collector_tx, mut collector_rx) = mpsc::unbounded_channel();

        let event = CandleEvent {
            symbol: "AAPL{=5m}".to_string(),
            time: 1_700_000_000_000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 100.0,
            event_flags: 0,
        };

        channel.install_candle_collector(collector_tx).await;
        channel.dispatch(vec![FeedEvent::Candle(event.clone())]).await;
        assert_eq!(collector_rx.recv().await.unwrap().symbol, "AAPL{=5m}");

        channel.restore_candle_handler().await;
        channel.dispatch(vec![FeedEvent::Candle(event)]).await;
        assert_eq!(
            default_rx.recv().await.unwrap().into_candle(Timeframe::M5).symbol,
            "AAPL"
        );
        assert!(collector_rx.try_recv().is_err());
    }
}
