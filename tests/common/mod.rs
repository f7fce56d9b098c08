//! Shared utilities for pusher-rs integration tests
//!
//! [`MockTransport`] hands every socket the client opens to the test, which
//! then plays the server: it feeds inbound frames and inspects what the
//! client writes.

#![allow(dead_code)]

use pusher_rs::transport::{OutboundFrame, SocketPeer, SocketSession, Transport, TransportEvent};
use pusher_rs::{ClientConfig, PusherClient, PusherEvent};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use url::Url;

pub const APP_KEY: &str = "app-key";
pub const SOCKET_ID: &str = "123.456";

const WAIT: Duration = Duration::from_secs(60);

/// Transport that never touches the network
pub struct MockTransport {
    sockets: mpsc::UnboundedSender<MockSocket>,
}

impl Transport for MockTransport {
    fn open(&self, url: &Url) -> SocketSession {
        let (session, peer) = SocketSession::pair();
        let _ = self.sockets.send(MockSocket {
            url: url.clone(),
            peer,
        });
        session
    }
}

/// Sockets opened through a [`MockTransport`], in opening order
pub struct MockSockets {
    sockets: mpsc::UnboundedReceiver<MockSocket>,
}

impl MockSockets {
    pub async fn next(&mut self) -> MockSocket {
        timeout(WAIT, self.sockets.recv())
            .await
            .expect("timed out waiting for the client to open a socket")
            .expect("transport dropped")
    }

    /// A socket opened since the last call, if any
    pub fn try_next(&mut self) -> Option<MockSocket> {
        self.sockets.try_recv().ok()
    }
}

/// The server's end of one client socket
pub struct MockSocket {
    pub url: Url,
    pub peer: SocketPeer,
}

impl MockSocket {
    pub fn push(&self, event: TransportEvent) {
        assert!(self.peer.emit(event), "client dropped the socket");
    }

    /// Send a frame the way Pusher does, with `data` JSON-encoded as a string
    pub fn send(&self, event: &str, channel: Option<&str>, data: Value) {
        let mut frame = json!({"event": event, "data": data.to_string()});
        if let Some(channel) = channel {
            frame["channel"] = json!(channel);
        }
        self.push(TransportEvent::Message(frame.to_string()));
    }

    pub fn establish(&self) {
        self.push(TransportEvent::Opened);
        self.send(
            "pusher:connection_established",
            None,
            json!({"socket_id": SOCKET_ID, "activity_timeout": 120}),
        );
    }

    pub async fn next_frame(&mut self) -> OutboundFrame {
        timeout(WAIT, self.peer.frames.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("client dropped the socket")
    }

    /// The next outbound text frame, parsed
    pub async fn next_message(&mut self) -> Value {
        match self.next_frame().await {
            OutboundFrame::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    pub fn try_next_frame(&mut self) -> Option<OutboundFrame> {
        self.peer.frames.try_recv().ok()
    }
}

pub fn mock_transport() -> (Arc<MockTransport>, MockSockets) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(MockTransport { sockets: tx }),
        MockSockets { sockets: rx },
    )
}

pub fn config() -> ClientConfig {
    ClientConfig::new(APP_KEY)
        .with_url("ws://localhost:6001/app/app-key")
        .with_logging(false)
}

pub fn client_with(config: ClientConfig) -> (PusherClient, MockSockets) {
    let (transport, sockets) = mock_transport();
    let client = PusherClient::with_transport(config, transport).unwrap();
    (client, sockets)
}

/// Connect and complete the handshake on the first socket
pub async fn connected_client(config: ClientConfig) -> (PusherClient, MockSockets, MockSocket) {
    let (client, mut sockets) = client_with(config);
    client.connect().unwrap();
    let socket = sockets.next().await;
    socket.establish();
    client
        .wait_for_state(|state| state.is_connected())
        .await
        .unwrap();
    (client, sockets, socket)
}

pub type Recorded = Arc<Mutex<Vec<PusherEvent>>>;

pub fn recorder() -> (Recorded, impl Fn(&PusherEvent) + Send + Sync + 'static) {
    let seen: Recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |event: &PusherEvent| {
        sink.lock().unwrap().push(event.clone())
    })
}

/// Poll until `condition` holds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Round-trip through the session so earlier commands are applied.
/// `channel` must already exist, or it is created.
pub async fn flush(client: &PusherClient, channel: &str) {
    client.channel(channel).await.unwrap();
}
