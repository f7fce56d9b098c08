//! End-to-end over a real WebSocket to a local Pusher-speaking server

use futures_util::{SinkExt, StreamExt};
use pusher_rs::{ClientConfig, ConnectionState, PusherClient};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// Accepts one client, greets it and reports every text frame it sends
async fn start_server() -> (SocketAddr, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws_stream = accept_async(stream).await.unwrap();
        let (mut write, mut read) = ws_stream.split();

        let established = json!({
            "event": "pusher:connection_established",
            "data": json!({"socket_id": "1.1", "activity_timeout": 120}).to_string(),
        });
        write
            .send(Message::Text(established.to_string()))
            .await
            .unwrap();

        while let Some(Ok(message)) = read.next().await {
            match message {
                Message::Text(text) => {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    if frame["event"] == "pusher:subscribe" {
                        let channel = frame["data"]["channel"].clone();
                        let succeeded = json!({
                            "event": "pusher_internal:subscription_succeeded",
                            "channel": channel,
                            "data": "{}",
                        });
                        let greeting = json!({
                            "event": "greeting",
                            "channel": channel,
                            "data": "{\"hello\":\"world\"}",
                        });
                        let _ = write.send(Message::Text(succeeded.to_string())).await;
                        let _ = write.send(Message::Text(greeting.to_string())).await;
                    }
                    let _ = frames_tx.send(frame);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    (addr, frames_rx)
}

#[tokio::test]
async fn connects_subscribes_and_receives_over_websocket() {
    let (addr, mut frames) = start_server().await;
    let config = ClientConfig::new("app-key").with_url(&format!("ws://{addr}/app/app-key"));
    let client = PusherClient::new(config).unwrap();

    let channel = client.channel("updates").await.unwrap();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    channel
        .bind("greeting", move |event| {
            let _ = events_tx.send(event.data.clone());
        })
        .unwrap();

    client.connect().unwrap();
    timeout(
        Duration::from_secs(5),
        client.wait_for_state(|s| *s == ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(client.socket_id().as_deref(), Some("1.1"));

    let subscribe = timeout(Duration::from_secs(5), frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        subscribe,
        json!({"event": "pusher:subscribe", "data": {"channel": "updates"}})
    );

    let greeting = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(greeting, json!({"hello": "world"}));

    client.disconnect().unwrap();
    timeout(
        Duration::from_secs(5),
        client.wait_for_state(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn refused_connection_reports_an_error_and_retries() {
    // Bind then drop to get a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = ClientConfig::new("app-key")
        .with_url(&format!("ws://{addr}/app/app-key"))
        .with_max_reconnection_attempts(1)
        .with_reconnect_gap(Duration::from_millis(10));
    let client = PusherClient::new(config).unwrap();
    let (errors_tx, mut errors) = mpsc::unbounded_channel();
    client
        .bind_global("pusher:error", move |event| {
            let _ = errors_tx.send(event.data["type"].as_str().map(str::to_string));
        })
        .unwrap();
    client.connect().unwrap();

    let mut seen = Vec::new();
    while seen.last() != Some(&Some("ReconnectError".to_string())) {
        let error = timeout(Duration::from_secs(5), errors.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(error);
    }
    assert_eq!(
        seen,
        vec![
            Some("TransportError".to_string()),
            Some("TransportError".to_string()),
            Some("ReconnectError".to_string()),
        ]
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
}
