//! Socket transport seam.
//!
//! The connection talks to the network only through [`Transport`]. Each call
//! to `open` yields a [`SocketSession`]: a queue of outbound frames and a
//! stream of [`TransportEvent`]s. Dropping the session closes the socket.

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode};
use tracing::{debug, error, info};
use url::Url;

use crate::error::PusherError;

/// Frames written by the connection
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Close {
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// Signals reported by an open socket
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Message(String),
    Closed { code: Option<u16>, reason: String },
    Error(TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Socket or network fault; eligible for reconnection
    Network,
    /// Handshake rejection or protocol violation
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Network,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Protocol,
            message: message.into(),
        }
    }

    pub fn is_network(&self) -> bool {
        self.kind == TransportErrorKind::Network
    }

    fn from_ws(e: &WsError) -> Self {
        match e {
            WsError::Io(_)
            | WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                Self::network(e.to_string())
            }
            _ => Self::protocol(e.to_string()),
        }
    }
}

/// The connection's end of one socket
#[derive(Debug)]
pub struct SocketSession {
    outgoing: mpsc::UnboundedSender<OutboundFrame>,
    incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

/// The transport's end of one socket
#[derive(Debug)]
pub struct SocketPeer {
    pub frames: mpsc::UnboundedReceiver<OutboundFrame>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl SocketPeer {
    /// Report an event; returns `false` once the session has been dropped
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

impl SocketSession {
    /// Create a connected session/peer pair
    pub fn pair() -> (SocketSession, SocketPeer) {
        let (outgoing, frames) = mpsc::unbounded_channel();
        let (events, incoming) = mpsc::unbounded_channel();
        (SocketSession { outgoing, incoming }, SocketPeer { frames, events })
    }

    pub fn send(&self, frame: OutboundFrame) -> Result<(), PusherError> {
        self.outgoing
            .send(frame)
            .map_err(|e| PusherError::SendError(e.to_string()))
    }

    /// Next event from the socket; `None` once the transport side is gone
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.incoming.recv().await
    }
}

/// Opens sockets to a Pusher endpoint
pub trait Transport: Send + Sync {
    fn open(&self, url: &Url) -> SocketSession;
}

/// WebSocket transport over tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, url: &Url) -> SocketSession {
        let (session, peer) = SocketSession::pair();
        tokio::spawn(run_socket(url.to_string(), peer));
        session
    }
}

async fn run_socket(url: String, mut peer: SocketPeer) {
    info!("Connecting to {}", url);

    let (ws_stream, response) = match connect_async(url.as_str()).await {
        Ok(connected) => connected,
        Err(e) => {
            error!("Failed to connect to WebSocket server: {}", e);
            peer.emit(TransportEvent::Error(TransportError::from_ws(&e)));
            return;
        }
    };
    debug!("Connected to WebSocket server. Response: {:?}", response);

    if !peer.emit(TransportEvent::Opened) {
        return;
    }

    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            frame = peer.frames.recv() => match frame {
                Some(OutboundFrame::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        error!("Error sending message: {}", e);
                        peer.emit(TransportEvent::Error(TransportError::from_ws(&e)));
                        break;
                    }
                }
                Some(OutboundFrame::Close { code, reason }) => {
                    let frame = code.map(|code| CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.unwrap_or_default().into(),
                    });
                    if let Err(e) = sink.send(Message::Close(frame)).await {
                        debug!("Error sending close frame: {}", e);
                    }
                    break;
                }
                None => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        debug!("Error sending close frame: {}", e);
                    }
                    break;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if !peer.emit(TransportEvent::Message(text)) {
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sink.send(Message::Pong(data)).await {
                        error!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                    debug!("Server closed the socket: {:?} {}", code, reason);
                    peer.emit(TransportEvent::Closed { code, reason });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    peer.emit(TransportEvent::Error(TransportError::from_ws(&e)));
                    break;
                }
                None => {
                    peer.emit(TransportEvent::Closed {
                        code: None,
                        reason: "stream ended".to_string(),
                    });
                    break;
                }
            }
        }
    }
}
