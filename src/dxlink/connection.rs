//! Connection manager for the DXLink session
//!
//! Owns the single WebSocket transport and everything scheduled on top of
//! it: the connect handshake (SETUP → AUTH → AUTH_STATE → default feed
//! channel), the keepalive and health-check timers, and the reconnection
//! state machine with exponential backoff, token refresh and
//! resubscription. All outbound sends are serialized through one
//! exclusive-send lock so message framing stays atomic across the
//! keepalive, health, reconnect and batch-fetch producers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StreamConfig;
use crate::dxlink::channel::{ChannelState, StreamChannel};
use crate::dxlink::protocol::{self, CandleEvent, WireMessage};
use crate::dxlink::types::{ConnectionState, ConnectionStats, Subscription, Tick};
use crate::error::{DxLinkError, Result};
use crate::ports::TokenProvider;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Reconnect delay for a given 1-based attempt: base doubled per attempt,
/// capped.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(cap)
}

/// The exclusive-send half of the shared socket.
///
/// Every producer (handshake, keepalive, subscriptions, batch fetch) sends
/// through this lock; a send while the socket is down fails with
/// [`DxLinkError::Send`], which fire-and-forget callers log and drop.
#[derive(Clone)]
pub struct Outbound {
    sink: Arc<Mutex<Option<WsSink>>>,
}

impl Outbound {
    fn new() -> Self {
        Self {
            sink: Arc::new(Mutex::new(None)),
        }
    }

    /// An outbound with no socket attached; sends fail. For tests.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::new()
    }

    async fn attach(&self, sink: WsSink) {
        *self.sink.lock().await = Some(sink);
    }

    async fn detach(&self) {
        *self.sink.lock().await = None;
    }

    async fn is_attached(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    /// Sends a close frame and drops the sink; used for normal closure so
    /// the server does not see an abnormal disconnect.
    async fn close(&self) {
        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            if let Err(e) = sink.send(Message::Close(None)).await {
                debug!(error = %e, "Close frame not delivered");
            }
        }
    }

    pub async fn send(&self, message: &WireMessage) -> Result<()> {
        let text = protocol::encode(message)?;
        let mut guard = self.sink.lock().await;
        match guard.as_mut() {
            Some(sink) => {
                debug!(message = %text, "Sending");
                sink.send(Message::Text(text.into()))
                    .await
                    .map_err(|e| DxLinkError::Send(e.to_string()))
            }
            None => Err(DxLinkError::Send("socket not open".to_string())),
        }
    }
}

struct ConnectionInner {
    config: StreamConfig,
    tokens: Arc<dyn TokenProvider>,
    outbound: Outbound,
    state_tx: watch::Sender<ConnectionState>,

    /// Channel table; entries live at most as long as the connection.
    channels: RwLock<HashMap<u64, Arc<StreamChannel>>>,
    default_channel: RwLock<Option<Arc<StreamChannel>>>,
    next_channel_id: AtomicU64,

    /// Symbols with live tick subscriptions, including ones queued before
    /// authentication; re-issued in full after every reconnect.
    tick_symbols: RwLock<HashSet<String>>,

    /// Token for the AUTH reply to the server SETUP.
    token: RwLock<String>,
    auth_sent: AtomicBool,
    auth_error: RwLock<Option<String>>,

    reconnect_attempts: AtomicU32,
    reconnect_inflight: AtomicBool,
    intentional_close: AtomicBool,
    timers_started: AtomicBool,
    connect_lock: Mutex<()>,

    /// Cancels the reader of the current session only.
    session_cancel: RwLock<CancellationToken>,
    shutdown: CancellationToken,

    tick_tx: mpsc::UnboundedSender<Tick>,
    candle_tx: mpsc::UnboundedSender<CandleEvent>,
}

/// Owner of the streaming session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

impl ConnectionManager {
    /// Creates a manager plus the receivers for the two always-on event
    /// pipes: live ticks, and candle events flowing outside a batch fetch.
    pub fn new(
        config: StreamConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<Tick>,
        mpsc::UnboundedReceiver<CandleEvent>,
    ) {
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (candle_tx, candle_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let manager = Self {
            inner: Arc::new(ConnectionInner {
                config,
                tokens,
                outbound: Outbound::new(),
                state_tx,
                channels: RwLock::new(HashMap::new()),
                default_channel: RwLock::new(None),
                next_channel_id: AtomicU64::new(protocol::CONTROL_CHANNEL + 1),
                tick_symbols: RwLock::new(HashSet::new()),
                token: RwLock::new(String::new()),
                auth_sent: AtomicBool::new(false),
                auth_error: RwLock::new(None),
                reconnect_attempts: AtomicU32::new(0),
                reconnect_inflight: AtomicBool::new(false),
                intentional_close: AtomicBool::new(false),
                timers_started: AtomicBool::new(false),
                connect_lock: Mutex::new(()),
                session_cancel: RwLock::new(CancellationToken::new()),
                shutdown: CancellationToken::new(),
                tick_tx,
                candle_tx,
            }),
        };
        (manager, tick_rx, candle_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// True iff the transport is open, authentication succeeded and the
    /// default feed channel is ready.
    pub async fn is_connected(&self) -> bool {
        if self.state() != ConnectionState::Ready || !self.inner.outbound.is_attached().await {
            return false;
        }
        match self.inner.default_channel.read().await.as_ref() {
            Some(channel) => channel.state() == ChannelState::Ready,
            None => false,
        }
    }

    /// Read-only diagnostic snapshot; never used for control decisions.
    pub async fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            state: self.state(),
            channel_count: self.inner.channels.read().await.len(),
            subscription_count: self.inner.tick_symbols.read().await.len(),
            reconnect_attempts: self.inner.reconnect_attempts.load(Ordering::SeqCst),
        }
    }

    /// Opens the transport and drives the handshake to ready state: client
    /// SETUP, AUTH on the server SETUP, AUTH_STATE=AUTHORIZED, then one
    /// default feed channel opened and configured. Bounded by the configured
    /// connect timeout.
    ///
    /// A failed handshake tears down whatever came up and, for retryable
    /// errors, hands recovery to the reconnection machine before returning
    /// the error. A handshake that stalls mid-way is therefore never left
    /// hanging: the connect timeout bounds the wait and the failure path
    /// schedules the retry.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_connected().await {
            return Ok(());
        }
        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.session_cancel.read().await.cancel();
                self.inner.outbound.detach().await;
                self.teardown_channels().await;
                self.inner
                    .state_tx
                    .send_replace(ConnectionState::Disconnected);
                if e.is_retryable() && !self.inner.intentional_close.load(Ordering::SeqCst) {
                    schedule_reconnect(Arc::clone(&self.inner), false);
                }
                Err(e)
            }
        }
    }

    /// One handshake attempt. Caller holds the connect lock and owns cleanup
    /// on failure.
    async fn establish(&self) -> Result<()> {
        let inner = &self.inner;
        let credentials = inner.tokens.stream_credentials().await?;
        info!(url = %credentials.url, "Connecting to feed");

        inner.state_tx.send_replace(ConnectionState::Connecting);
        *inner.token.write().await = credentials.token;
        inner.auth_sent.store(false, Ordering::SeqCst);
        *inner.auth_error.write().await = None;
        inner.intentional_close.store(false, Ordering::SeqCst);

        let (ws_stream, _) = connect_async(&credentials.url).await?;
        let (sink, stream) = ws_stream.split();
        inner.outbound.attach(sink).await;

        // Replace the session token so a reader from a previous session
        // cannot outlive its socket.
        let session = inner.shutdown.child_token();
        {
            let mut held = inner.session_cancel.write().await;
            held.cancel();
            *held = session.clone();
        }
        tokio::spawn(run_reader(Arc::clone(&self.inner), stream, session));

        inner
            .outbound
            .send(&WireMessage::setup(inner.config.keepalive_timeout_secs))
            .await?;
        inner.state_tx.send_replace(ConnectionState::AwaitingAuth);

        let wait = inner.config.connect_timeout;
        self.wait_for_state(wait, |state| {
            matches!(state, ConnectionState::Authenticated | ConnectionState::Failed)
        })
        .await?;
        if self.state() == ConnectionState::Failed {
            let reason = inner
                .auth_error
                .read()
                .await
                .clone()
                .unwrap_or_else(|| "authentication failed".to_string());
            return Err(DxLinkError::Authentication(reason));
        }

        let channel = self.open_channel().await?;
        channel.wait_ready(wait).await?;
        *inner.default_channel.write().await = Some(Arc::clone(&channel));

        inner.state_tx.send_replace(ConnectionState::Ready);
        inner.reconnect_attempts.store(0, Ordering::SeqCst);
        info!(channel = channel.id(), "Feed session ready");

        self.resubscribe().await;
        self.ensure_timers();
        Ok(())
    }

    /// Closes the transport with a normal closure and cancels every
    /// scheduled task. Terminal; auto-reconnect is suppressed.
    pub async fn disconnect(&self) {
        info!("Disconnecting");
        self.inner.intentional_close.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();
        self.inner.outbound.close().await;
        self.teardown_channels().await;
        self.inner.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Resets the backoff counter and immediately schedules a reconnect
    /// attempt; the manual way out of the Failed state.
    pub fn force_reconnect(&self) {
        info!("Force reconnect requested");
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        schedule_reconnect(Arc::clone(&self.inner), true);
    }

    /// Subscribes a symbol to live quotes and trades. Before the session is
    /// ready the symbol is only recorded; it is flushed once the default
    /// channel configures (and after every reconnect). Fire-and-forget: send
    /// problems are logged, not returned.
    pub async fn subscribe(&self, symbol: &str) {
        let added = self
            .inner
            .tick_symbols
            .write()
            .await
            .insert(symbol.to_string());
        if !added {
            debug!(symbol = %symbol, "Already subscribed");
            return;
        }
        if !self.is_connected().await {
            warn!(symbol = %symbol, "Not ready yet, queueing subscription");
            return;
        }
        if let Some(channel) = self.default_channel().await {
            let subs = vec![Subscription::quote(symbol), Subscription::trade(symbol)];
            if let Err(e) = channel.subscribe(subs).await {
                warn!(symbol = %symbol, error = %e, "Subscribe send failed, dropped");
            } else {
                info!(symbol = %symbol, "Subscribed");
            }
        }
    }

    /// Removes a symbol's live tick subscription; absent symbols are a no-op.
    pub async fn unsubscribe(&self, symbol: &str) {
        let removed = self.inner.tick_symbols.write().await.remove(symbol);
        if !removed {
            return;
        }
        if let Some(channel) = self.default_channel().await {
            let subs = vec![Subscription::quote(symbol), Subscription::trade(symbol)];
            if let Err(e) = channel.unsubscribe(subs).await {
                warn!(symbol = %symbol, error = %e, "Unsubscribe send failed, dropped");
            } else {
                info!(symbol = %symbol, "Unsubscribed");
            }
        }
    }

    /// Subscribes candle streams on the default channel (batch fetch path).
    pub async fn subscribe_candles(&self, subs: Vec<Subscription>) -> Result<()> {
        let channel = self
            .default_channel()
            .await
            .ok_or_else(|| DxLinkError::Send("no feed channel".to_string()))?;
        channel.subscribe(subs).await
    }

    /// Removes candle streams from the default channel.
    pub async fn unsubscribe_candles(&self, subs: Vec<Subscription>) -> Result<()> {
        let channel = self
            .default_channel()
            .await
            .ok_or_else(|| DxLinkError::Send("no feed channel".to_string()))?;
        channel.unsubscribe(subs).await
    }

    /// Redirects candle events to `collector` for the duration of a batch
    /// fetch. Caller must hold the batch serialization lock.
    pub async fn install_candle_collector(&self, collector: mpsc::UnboundedSender<CandleEvent>) {
        if let Some(channel) = self.default_channel().await {
            channel.install_candle_collector(collector).await;
        }
    }

    /// Restores the default candle path after a batch fetch.
    pub async fn restore_candle_handler(&self) {
        if let Some(channel) = self.default_channel().await {
            channel.restore_candle_handler().await;
        }
    }

    pub async fn default_channel(&self) -> Option<Arc<StreamChannel>> {
        self.inner.default_channel.read().await.clone()
    }

    async fn wait_for_state<F>(&self, wait: Duration, predicate: F) -> Result<()>
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = self.inner.state_tx.subscribe();
        timeout(wait, rx.wait_for(predicate))
            .await
            .map_err(|_| DxLinkError::ConnectTimeout(wait.as_secs()))?
            .map_err(|_| DxLinkError::Send("connection state tracker dropped".to_string()))?;
        Ok(())
    }

    /// Allocates the next channel id and requests a feed channel for it.
    async fn open_channel(&self) -> Result<Arc<StreamChannel>> {
        let id = self.inner.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(StreamChannel::new(
            id,
            self.inner.outbound.clone(),
            self.inner.tick_tx.clone(),
            self.inner.candle_tx.clone(),
        ));
        self.inner
            .channels
            .write()
            .await
            .insert(id, Arc::clone(&channel));
        channel.open().await?;
        Ok(channel)
    }

    /// Re-issues quote/trade subscriptions for every recorded symbol, in one
    /// batched request. The channel's own set semantics make this idempotent.
    async fn resubscribe(&self) {
        let symbols: Vec<String> = self
            .inner
            .tick_symbols
            .read()
            .await
            .iter()
            .cloned()
            .collect();
        if symbols.is_empty() {
            return;
        }
        let Some(channel) = self.default_channel().await else {
            return;
        };
        let subs: Vec<Subscription> = symbols
            .iter()
            .flat_map(|s| [Subscription::quote(s.clone()), Subscription::trade(s.clone())])
            .collect();
        info!(count = symbols.len(), "Re-issuing tick subscriptions");
        if let Err(e) = channel.subscribe(subs).await {
            warn!(error = %e, "Resubscription send failed");
        }
    }

    async fn teardown_channels(&self) {
        let mut channels = self.inner.channels.write().await;
        for channel in channels.values() {
            channel.invalidate().await;
        }
        channels.clear();
        *self.inner.default_channel.write().await = None;
    }

    /// Starts the keepalive and health-check timers once per manager.
    fn ensure_timers(&self) {
        if self.inner.timers_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(run_keepalive(Arc::clone(&self.inner)));
        tokio::spawn(run_health_check(Arc::clone(&self.inner), self.clone()));
    }
}

/// Reads the socket until it ends, dispatching frames. An end without a
/// deliberate disconnect or a normal-code close frame triggers the
/// reconnection path.
async fn run_reader(inner: Arc<ConnectionInner>, mut stream: WsStream, cancel: CancellationToken) {
    let mut normal_close = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(&inner, &text).await,
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    // A close without a code is treated as abnormal.
                    normal_close = frame
                        .as_ref()
                        .map_or(false, |f| f.code == CloseCode::Normal);
                    info!(frame = ?frame, "Close frame received");
                    break;
                }
                Some(Ok(_)) => debug!("Ignoring non-text message"),
                Some(Err(e)) => {
                    error!(error = %e, "Socket read error");
                    break;
                }
                None => break,
            }
        }
    }

    inner.outbound.detach().await;
    if inner.intentional_close.load(Ordering::SeqCst) || inner.shutdown.is_cancelled() {
        return;
    }
    if normal_close {
        info!("Server closed the session normally, not reconnecting");
        let manager = ConnectionManager {
            inner: Arc::clone(&inner),
        };
        manager.teardown_channels().await;
        inner.state_tx.send_replace(ConnectionState::Disconnected);
        return;
    }
    warn!("Socket closed abnormally");
    schedule_reconnect(inner, false);
}

async fn handle_frame(inner: &Arc<ConnectionInner>, text: &str) {
    let message = match protocol::decode(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, frame = %text, "Undecodable frame");
            return;
        }
    };

    match message {
        WireMessage::Setup { version, .. } => {
            debug!(version = %version, "Server SETUP received, authenticating");
            let token = inner.token.read().await.clone();
            inner.auth_sent.store(true, Ordering::SeqCst);
            if let Err(e) = inner.outbound.send(&WireMessage::auth(&token)).await {
                warn!(error = %e, "AUTH send failed");
            }
        }
        WireMessage::AuthState { state, .. } => handle_auth_state(inner, &state).await,
        WireMessage::ChannelOpened { channel, .. } => {
            match inner.channels.read().await.get(&channel) {
                Some(target) => {
                    if let Err(e) = target.handle_opened().await {
                        warn!(channel, error = %e, "Feed setup send failed");
                    }
                }
                None => debug!(channel, "CHANNEL_OPENED for unknown channel"),
            }
        }
        WireMessage::FeedConfig {
            channel,
            data_format,
        } => {
            if let Some(target) = inner.channels.read().await.get(&channel) {
                target.handle_config(&data_format);
            }
        }
        WireMessage::FeedData { channel, data } => {
            let events = protocol::decode_feed_data(&data);
            if let Some(target) = inner.channels.read().await.get(&channel) {
                target.dispatch(events).await;
            } else {
                debug!(channel, "FEED_DATA for unknown channel");
            }
        }
        WireMessage::Keepalive { .. } => {
            // Echo immediately in addition to the periodic timer.
            if let Err(e) = inner.outbound.send(&WireMessage::keepalive()).await {
                debug!(error = %e, "Keepalive echo failed");
            }
        }
        WireMessage::Error { error, message } => {
            warn!(error = %error, message = %message, "Feed error message");
        }
        WireMessage::Unknown => debug!("Ignoring unhandled message type"),
        other => debug!(message = ?other, "Ignoring client-directional message"),
    }
}

async fn handle_auth_state(inner: &Arc<ConnectionInner>, state: &str) {
    if state == "AUTHORIZED" {
        info!("Feed authentication succeeded");
        inner.state_tx.send_replace(ConnectionState::Authenticated);
    } else if inner.auth_sent.load(Ordering::SeqCst) {
        // The feed reports UNAUTHORIZED once before AUTH is processed; only
        // a non-authorized state after our AUTH is a rejection.
        error!(state = %state, "Feed authentication failed");
        *inner.auth_error.write().await = Some(format!("auth state: {}", state));
        inner.state_tx.send_replace(ConnectionState::Failed);
    } else {
        debug!(state = %state, "Pre-auth state");
    }
}

/// Periodic KEEPALIVE on the control channel while the socket is attached.
async fn run_keepalive(inner: Arc<ConnectionInner>) {
    let mut ticker = tokio::time::interval(inner.config.keepalive_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = ticker.tick() => {
                if !inner.outbound.is_attached().await {
                    continue;
                }
                if let Err(e) = inner.outbound.send(&WireMessage::keepalive()).await {
                    debug!(error = %e, "Keepalive send failed");
                }
            }
        }
    }
}

/// Periodic liveness verification; a failed check funnels into the same
/// guarded reconnect path as an abnormal closure.
async fn run_health_check(inner: Arc<ConnectionInner>, manager: ConnectionManager) {
    let mut ticker = tokio::time::interval(inner.config.health_check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let state = *inner.state_tx.borrow();
                if matches!(
                    state,
                    ConnectionState::Failed
                        | ConnectionState::Reconnecting
                        | ConnectionState::Connecting
                        | ConnectionState::AwaitingAuth
                        | ConnectionState::Disconnected
                ) {
                    continue;
                }
                if !manager.is_connected().await {
                    warn!(state = %state, "Health check failed");
                    schedule_reconnect(Arc::clone(&inner), false);
                }
            }
        }
    }
}

/// Runs reconnect attempts with exponential backoff until one succeeds or
/// the attempt budget is spent. A single in-flight guard prevents the
/// closure-triggered and health-triggered paths from overlapping.
fn schedule_reconnect(inner: Arc<ConnectionInner>, immediate: bool) {
    if inner.shutdown.is_cancelled() {
        return;
    }
    if inner.reconnect_inflight.swap(true, Ordering::SeqCst) {
        debug!("Reconnect already in flight");
        return;
    }

    tokio::spawn(async move {
        let mut first = true;
        loop {
            if inner.reconnect_attempts.load(Ordering::SeqCst)
                >= inner.config.max_reconnect_attempts
            {
                let err = DxLinkError::MaxReconnectAttempts;
                error!(
                    attempts = inner.config.max_reconnect_attempts,
                    kind = err.error_type(),
                    "{}, giving up until forced", err
                );
                inner.state_tx.send_replace(ConnectionState::Failed);
                break;
            }
            let attempt = inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;

            inner.state_tx.send_replace(ConnectionState::Reconnecting);
            let delay = if first && immediate {
                Duration::ZERO
            } else {
                backoff_delay(attempt, inner.config.reconnect_base, inner.config.reconnect_cap)
            };
            first = false;
            info!(attempt, delay_secs = delay.as_secs(), "Scheduling reconnect");

            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }

            let manager = ConnectionManager {
                inner: Arc::clone(&inner),
            };
            manager.inner.outbound.detach().await;
            manager.teardown_channels().await;

            match manager.connect().await {
                Ok(()) => {
                    info!(attempt, "Reconnected");
                    break;
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, kind = e.error_type(), "Reconnect attempt failed");
                }
                Err(e) => {
                    error!(attempt, error = %e, kind = e.error_type(), "Unrecoverable reconnect failure");
                    inner.state_tx.send_replace(ConnectionState::Failed);
                    break;
                }
            }
        }
        inner.reconnect_inflight.store(false, Ordering::SeqCst);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::StaticTokenProvider;

    const BASE: Duration = Duration::from_secs(5);
    const CAP: Duration = Duration::from_secs(300);

    #[test]
    fn backoff_sequence_doubles_from_base() {
        let delays: Vec<u64> = (1..=5)
            .map(|attempt| backoff_delay(attempt, BASE, CAP).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80]);
    }

    #[test]
    fn backoff_caps_at_five_minutes() {
        assert_eq!(backoff_delay(10, BASE, CAP), CAP);
        assert_eq!(backoff_delay(30, BASE, CAP), CAP);
        // Large attempt numbers must not overflow.
        assert_eq!(backoff_delay(u32::MAX, BASE, CAP), CAP);
    }

    #[tokio::test]
    async fn starts_disconnected_with_empty_stats() {
        let tokens = Arc::new(StaticTokenProvider::new("token", "wss://example.invalid"));
        let (manager, _ticks, _candles) = ConnectionManager::new(StreamConfig::default(), tokens);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_connected().await);
        let stats = manager.stats().await;
        assert_eq!(stats.channel_count, 0);
        assert_eq!(stats.subscription_count, 0);
        assert_eq!(stats.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn subscribe_before_connect_queues_symbol() {
        let tokens = Arc::new(StaticTokenProvider::new("token", "wss://example.invalid"));
        let (manager, _ticks, _candles) = ConnectionManager::new(StreamConfig::default(), tokens);
        manager.subscribe("AAPL").await;
        manager.subscribe("AAPL").await;
        manager.subscribe("MSFT").await;
        assert_eq!(manager.stats().await.subscription_count, 2);
        manager.unsubscribe("AAPL").await;
        manager.unsubscribe("AAPL").await;
        assert_eq!(manager.stats().await.subscription_count, 1);
    }
}
