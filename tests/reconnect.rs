//! Connection recovery against scripted servers
//!
//! Real sockets on loopback with small timeouts. Each server speaks just
//! enough of the control protocol to push the client into the scenario
//! under test: a handshake that stalls after the transport opens, a server
//! that drops the session mid-stream, and a server that closes normally.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dxlink_provider::config::StreamConfig;
use dxlink_provider::dxlink::types::ConnectionState;
use dxlink_provider::dxlink::ConnectionManager;
use dxlink_provider::ports::StaticTokenProvider;
use dxlink_provider::DxLinkError;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type WsServer = WebSocketStream<TcpStream>;

fn test_config() -> StreamConfig {
    StreamConfig {
        connect_timeout: Duration::from_millis(500),
        reconnect_base: Duration::from_millis(50),
        reconnect_cap: Duration::from_millis(50),
        max_reconnect_attempts: 2,
        ..StreamConfig::default()
    }
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

fn manager_for(
    url: &str,
    config: StreamConfig,
) -> (
    ConnectionManager,
    mpsc::UnboundedReceiver<dxlink_provider::dxlink::types::Tick>,
    mpsc::UnboundedReceiver<dxlink_provider::dxlink::protocol::CandleEvent>,
) {
    let tokens = Arc::new(StaticTokenProvider::new("test-token", url));
    ConnectionManager::new(config, tokens)
}

async fn wait_for_state(manager: &ConnectionManager, target: ConnectionState, deadline: Duration) {
    let step = Duration::from_millis(25);
    let mut waited = Duration::ZERO;
    while manager.state() != target {
        assert!(
            waited < deadline,
            "never reached {}, still {}",
            target,
            manager.state()
        );
        tokio::time::sleep(step).await;
        waited += step;
    }
}

async fn send_json(ws: &mut WsServer, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Answers one client control message with the scripted server response.
async fn answer_control(ws: &mut WsServer, value: &Value) {
    match value["type"].as_str().unwrap_or_default() {
        "SETUP" => {
            send_json(
                ws,
                json!({
                    "type": "SETUP",
                    "channel": 0,
                    "version": "1.0-test",
                    "keepaliveTimeout": 60,
                    "acceptKeepaliveTimeout": 60,
                }),
            )
            .await
        }
        "AUTH" => {
            send_json(
                ws,
                json!({ "type": "AUTH_STATE", "channel": 0, "state": "AUTHORIZED" }),
            )
            .await
        }
        "CHANNEL_REQUEST" => {
            let channel = value["channel"].as_u64().unwrap();
            send_json(
                ws,
                json!({ "type": "CHANNEL_OPENED", "channel": channel, "service": "FEED" }),
            )
            .await
        }
        "FEED_SETUP" => {
            let channel = value["channel"].as_u64().unwrap();
            send_json(
                ws,
                json!({ "type": "FEED_CONFIG", "channel": channel, "dataFormat": "COMPACT" }),
            )
            .await
        }
        _ => {}
    }
}

/// Drives the handshake and returns the first FEED_SUBSCRIPTION received,
/// or `None` when the client goes away first.
async fn next_subscription(ws: &mut WsServer) -> Option<Value> {
    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        if value["type"] == "FEED_SUBSCRIPTION" {
            return Some(value);
        }
        answer_control(ws, &value).await;
    }
    None
}

#[tokio::test]
async fn stalled_handshake_reconnects_until_the_budget_ends() {
    let (listener, url) = bind().await;
    // Accepts every connection and never answers the handshake.
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });

    let config = test_config();
    let max_attempts = config.max_reconnect_attempts;
    let (manager, _ticks, _candles) = manager_for(&url, config);

    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, DxLinkError::ConnectTimeout(_)));

    // The failed handshake must hand off to the reconnection machine, which
    // retries until the budget is spent and then parks in Failed.
    wait_for_state(&manager, ConnectionState::Failed, Duration::from_secs(10)).await;
    assert_eq!(manager.stats().await.reconnect_attempts, max_attempts);

    // No further attempt is scheduled past the budget.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(manager.state(), ConnectionState::Failed);
    assert_eq!(manager.stats().await.reconnect_attempts, max_attempts);
}

#[tokio::test]
async fn tick_subscriptions_are_reissued_after_reconnect() {
    let (listener, url) = bind().await;
    let (subs_tx, mut subs_rx) = mpsc::unbounded_channel::<(usize, Value)>();
    tokio::spawn(async move {
        for conn in 1usize.. {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            if let Some(sub) = next_subscription(&mut ws).await {
                let _ = subs_tx.send((conn, sub));
            }
            if conn == 1 {
                // Abrupt drop, no close frame: abnormal from the client's
                // point of view.
                drop(ws);
            } else {
                while let Some(Ok(_)) = ws.next().await {}
                return;
            }
        }
    });

    let (manager, _ticks, _candles) = manager_for(&url, test_config());
    manager.connect().await.unwrap();
    manager.subscribe("AAPL").await;

    let (conn, first) = tokio::time::timeout(Duration::from_secs(5), subs_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conn, 1);
    assert_eq!(first["type"], "FEED_SUBSCRIPTION");

    // The server dropped the first session right after that subscription;
    // the reconnected session must re-issue the full symbol set unprompted.
    let (conn, second) = tokio::time::timeout(Duration::from_secs(5), subs_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conn, 2);
    let add = second["add"].as_array().unwrap();
    let symbols: Vec<&str> = add.iter().map(|e| e["symbol"].as_str().unwrap()).collect();
    let kinds: Vec<&str> = add.iter().map(|e| e["type"].as_str().unwrap()).collect();
    assert!(symbols.iter().all(|s| *s == "AAPL"));
    assert!(kinds.contains(&"Quote"));
    assert!(kinds.contains(&"Trade"));
}

#[tokio::test]
async fn normal_server_close_does_not_reconnect() {
    let (listener, url) = bind().await;
    let accepted = Arc::new(AtomicUsize::new(0));
    let accepted_by_server = Arc::clone(&accepted);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            accepted_by_server.fetch_add(1, Ordering::SeqCst);
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            while let Some(Ok(message)) = ws.next().await {
                let Message::Text(text) = message else { continue };
                let value: Value = serde_json::from_str(&text).unwrap();
                let done = value["type"] == "FEED_SETUP";
                answer_control(&mut ws, &value).await;
                if done {
                    // Let the client finish its handshake before closing.
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    let _ = ws
                        .close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "done".into(),
                        }))
                        .await;
                }
            }
        }
    });

    let (manager, _ticks, _candles) = manager_for(&url, test_config());
    manager.connect().await.unwrap();

    wait_for_state(&manager, ConnectionState::Disconnected, Duration::from_secs(5)).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.stats().await.reconnect_attempts, 0);
    assert_eq!(accepted.load(Ordering::SeqCst), 1, "no reconnect expected");
}
