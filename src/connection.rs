//! The connection session: one task that owns the socket, the channel
//! registry, the global dispatcher and the liveness timers.
//!
//! Every input (application commands, socket events, auth results and timer
//! expiries) is handled one at a time on that task, so inbound frames are
//! processed strictly in arrival order.

use serde::Serialize;
use serde_json::{Value, json};
use std::fmt;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use crate::auth::{AuthData, AuthRequest, Authorizer};
use crate::channel::{ChannelContext, ChannelStatus, Subscribable, Triggerable};
use crate::config::ClientConfig;
use crate::crypto::Decryptor;
use crate::error::PusherError;
use crate::event::{EventDispatcher, Listener, ListenerId, PusherEvent};
use crate::message::{
    self, CONNECTION_ESTABLISHED, ConnectionData, ErrorData, PING, PONG, PusherMessage,
};
use crate::registry::ChannelRegistry;
use crate::timer::Timer;
use crate::transport::{OutboundFrame, SocketSession, Transport, TransportEvent};

pub const CONNECTION_STATE_CHANGED: &str = "connection_state_changed";

/// Close code used when the transport fails underneath us
pub const ABNORMAL_CLOSURE: u16 = 1006;
pub const MAX_RECONNECTION_REASON: &str = "Max reconnection attempts reached.";
pub const ACTIVITY_TIMEOUT_REASON: &str = "Activity timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Reconnected,
    Disconnecting,
}

impl ConnectionState {
    /// Lifecycle event fired on entering this state
    pub fn lifecycle_event(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Reconnected => "reconnected",
            Self::Disconnecting => "disconnecting",
        }
    }

    /// Whether the server has established the session
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Reconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.lifecycle_event())
    }
}

/// Requests from client and channel handles to the session
pub(crate) enum Command {
    Connect,
    Disconnect {
        code: Option<u16>,
        reason: Option<String>,
    },
    SendEvent {
        event: String,
        data: Value,
        channel: Option<String>,
        reply: oneshot::Sender<Result<(), PusherError>>,
    },
    Channel {
        name: String,
        reply: oneshot::Sender<watch::Receiver<ChannelStatus>>,
    },
    Subscribe {
        name: String,
        reply: Option<oneshot::Sender<watch::Receiver<ChannelStatus>>>,
    },
    Unsubscribe {
        name: String,
    },
    UnsubscribeAll,
    Trigger {
        channel: String,
        event: String,
        data: Value,
    },
    Bind {
        channel: Option<String>,
        event: String,
        id: ListenerId,
        listener: Listener,
    },
    Unbind {
        channel: Option<String>,
        event: String,
    },
    UnbindListener {
        channel: Option<String>,
        id: ListenerId,
    },
}

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;

/// Result of an authorization started by a channel subscribe
pub(crate) struct AuthOutcome {
    request: AuthRequest,
    result: Result<AuthData, PusherError>,
}

/// Everything a channel may touch while the registry is borrowed
struct Link {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    authorizer: Option<Arc<dyn Authorizer>>,
    decryptor: Arc<dyn Decryptor>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    socket_id: Option<String>,
    socket_id_tx: watch::Sender<Option<String>>,
    socket: Option<SocketSession>,
    auth_tx: mpsc::UnboundedSender<AuthOutcome>,
}

impl Link {
    fn set_socket_id(&mut self, socket_id: Option<String>) {
        self.socket_id_tx.send_replace(socket_id.clone());
        self.socket_id = socket_id;
    }
}

impl ChannelContext for Link {
    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    fn socket_id(&self) -> Option<&str> {
        self.socket_id.as_deref()
    }

    fn send(&mut self, message: &PusherMessage) -> Result<(), PusherError> {
        let socket = self.socket.as_ref().ok_or(PusherError::NotConnected)?;
        let text = message.to_text()?;
        if self.config.enable_logging {
            trace!("Sending message: {}", text);
        }
        socket.send(OutboundFrame::Text(text))
    }

    fn request_auth(&mut self, channel_name: &str, socket_id: &str) {
        let request = AuthRequest {
            channel_name: channel_name.to_string(),
            socket_id: socket_id.to_string(),
        };
        let auth_tx = self.auth_tx.clone();

        let Some(authorizer) = self.authorizer.clone() else {
            let _ = auth_tx.send(AuthOutcome {
                request,
                result: Err(PusherError::AuthError(
                    "No authentication method available".to_string(),
                )),
            });
            return;
        };

        tokio::spawn(async move {
            let result = authorizer.authorize(&request).await;
            let _ = auth_tx.send(AuthOutcome { request, result });
        });
    }

    fn decryptor(&self) -> &dyn Decryptor {
        self.decryptor.as_ref()
    }
}

/// Shared observation points handed to the client handle
pub(crate) struct SessionWatch {
    pub state: watch::Receiver<ConnectionState>,
    pub socket_id: watch::Receiver<Option<String>>,
}

pub(crate) struct Session {
    commands: mpsc::UnboundedReceiver<Command>,
    link: Link,
    registry: ChannelRegistry,
    dispatcher: EventDispatcher,
    reconnect_attempts: u32,
    activity_timeout: Duration,
    activity_timer: Timer,
    pong_timer: Timer,
    reconnect_timer: Timer,
    auth_rx: mpsc::UnboundedReceiver<AuthOutcome>,
}

impl Session {
    pub fn new(
        config: Arc<ClientConfig>,
        transport: Arc<dyn Transport>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> (Self, SessionWatch) {
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (socket_id_tx, socket_id) = watch::channel(None);
        let (auth_tx, auth_rx) = mpsc::unbounded_channel();

        let session = Self {
            commands,
            activity_timeout: config.activity_timeout,
            link: Link {
                authorizer: config.resolve_authorizer(),
                decryptor: config.resolve_decryptor(),
                config,
                transport,
                state: ConnectionState::Disconnected,
                state_tx,
                socket_id: None,
                socket_id_tx,
                socket: None,
                auth_tx,
            },
            registry: ChannelRegistry::new(),
            dispatcher: EventDispatcher::new(),
            reconnect_attempts: 0,
            activity_timer: Timer::new(),
            pong_timer: Timer::new(),
            reconnect_timer: Timer::new(),
            auth_rx,
        };
        (session, SessionWatch { state, socket_id })
    }

    /// Run until every handle has been dropped
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = next_transport_event(&mut self.link.socket) => {
                    self.handle_transport_event(event);
                }
                Some(outcome) = self.auth_rx.recv() => self.handle_auth_outcome(outcome),
                () = self.activity_timer.expired() => self.send_ping(),
                () = self.pong_timer.expired() => self.handle_pong_timeout(),
                () = self.reconnect_timer.expired() => {
                    info!("Reconnection attempt {}", self.reconnect_attempts);
                    self.open_socket(ConnectionState::Reconnecting);
                }
            }
        }

        debug!("All client handles dropped, shutting down connection");
        self.disconnect(None, None);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                self.reconnect_timer.stop();
                self.reconnect_attempts = 0;
                self.open_socket(ConnectionState::Connecting);
            }
            Command::Disconnect { code, reason } => self.disconnect(code, reason),
            Command::SendEvent {
                event,
                data,
                channel,
                reply,
            } => {
                let result = self.link.send(&PusherMessage::new(event, data, channel));
                let _ = reply.send(result);
            }
            Command::Channel { name, reply } => {
                let _ = reply.send(self.registry.get_or_create(&name).watch());
            }
            Command::Subscribe { name, reply } => {
                self.registry.subscribe(&name, &mut self.link, false);
                if let Some(reply) = reply
                    && let Some(channel) = self.registry.get(&name)
                {
                    let _ = reply.send(channel.watch());
                }
            }
            Command::Unsubscribe { name } => self.unsubscribe(&name),
            Command::UnsubscribeAll => {
                let link = &mut self.link;
                self.registry.drain(|mut channel| channel.unsubscribe(&mut *link));
            }
            Command::Trigger {
                channel,
                event,
                data,
            } => match self.registry.get_mut(&channel) {
                Some(state) => state.trigger(&mut self.link, &event, data),
                None => {
                    warn!("Trigger on unknown channel {}", channel);
                    self.emit(
                        message::ERROR,
                        json!({"type": "ClientEventError", "message": format!("No channel named {channel}")}),
                    );
                }
            },
            Command::Bind {
                channel,
                event,
                id,
                listener,
            } => match channel {
                Some(name) => match self.registry.get_mut(&name) {
                    Some(state) => state.dispatcher_mut().bind_with_id(id, &event, listener),
                    None => warn!("Ignoring bind of {} on unknown channel {}", event, name),
                },
                None => self.dispatcher.bind_with_id(id, &event, listener),
            },
            Command::Unbind { channel, event } => {
                let dispatcher = match channel {
                    Some(name) => self.registry.get_mut(&name).map(|c| c.dispatcher_mut()),
                    None => Some(&mut self.dispatcher),
                };
                if let Some(dispatcher) = dispatcher {
                    dispatcher.unbind(&event);
                }
            }
            Command::UnbindListener { channel, id } => {
                let dispatcher = match channel {
                    Some(name) => self.registry.get_mut(&name).map(|c| c.dispatcher_mut()),
                    None => Some(&mut self.dispatcher),
                };
                if let Some(dispatcher) = dispatcher {
                    dispatcher.unbind_listener(id);
                }
            }
        }
    }

    fn unsubscribe(&mut self, name: &str) {
        match self.registry.remove(name) {
            Some(mut channel) => {
                debug!(
                    "Unsubscribing from {} (subscribed: {})",
                    name,
                    channel.is_subscribed()
                );
                channel.unsubscribe(&mut self.link);
            }
            None => debug!("Unsubscribe for unknown channel {}", name),
        }
    }

    fn emit(&self, event: &str, data: Value) {
        self.dispatcher.dispatch(&PusherEvent::new(event, None, data));
    }

    fn transition(&mut self, next: ConnectionState, detail: Value) {
        let previous = self.link.state;
        if previous == next {
            return;
        }
        debug!("Connection state {} -> {}", previous, next);

        self.link.state = next;
        self.link.state_tx.send_replace(next);
        if next.is_connected() {
            self.reconnect_attempts = 0;
        }

        self.emit(
            CONNECTION_STATE_CHANGED,
            json!({"previous": previous, "current": next}),
        );
        self.emit(next.lifecycle_event(), detail);
    }

    /// Replace any existing socket with a fresh one
    fn open_socket(&mut self, state: ConnectionState) {
        let url = match self.link.config.url() {
            Ok(url) => url,
            Err(e) => {
                error!("Cannot build connection URL: {}", e);
                self.emit(message::ERROR, json!({"message": e.to_string()}));
                return;
            }
        };

        if self.link.socket.take().is_some() {
            debug!("Discarding previous socket before connecting");
            self.stop_liveness();
            self.link.set_socket_id(None);
            self.registry.for_each(|channel| channel.reset());
        }

        info!("Connecting to Pusher at {}", url);
        self.link.socket = Some(self.link.transport.open(&url));
        self.transition(state, Value::Null);
    }

    fn stop_liveness(&mut self) {
        self.activity_timer.stop();
        self.pong_timer.stop();
    }

    /// Close the socket and settle in `Disconnected`. Safe to repeat.
    fn disconnect(&mut self, code: Option<u16>, reason: Option<String>) {
        self.reconnect_timer.stop();
        self.stop_liveness();

        if self.link.socket.is_none() && self.link.state == ConnectionState::Disconnected {
            return;
        }

        self.transition(ConnectionState::Disconnecting, Value::Null);
        if let Some(socket) = self.link.socket.take() {
            let close = match code {
                // 1006 is reserved for local use and may not be sent on the wire
                Some(ABNORMAL_CLOSURE) => OutboundFrame::Close {
                    code: None,
                    reason: None,
                },
                _ => OutboundFrame::Close {
                    code,
                    reason: reason.clone(),
                },
            };
            if let Err(e) = socket.send(close) {
                debug!("Error sending close frame: {}", e);
            }
        }

        self.link.set_socket_id(None);
        self.registry.for_each(|channel| channel.reset());
        self.transition(
            ConnectionState::Disconnected,
            json!({"code": code, "reason": reason}),
        );
    }

    fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Opened) => debug!("Socket open, awaiting connection_established"),
            Some(TransportEvent::Message(text)) => self.handle_frame(&text),
            Some(TransportEvent::Closed { code, reason }) => match code {
                None | Some(ABNORMAL_CLOSURE) => self.handle_transport_failure(true, reason),
                Some(code) => {
                    info!("Server closed connection: {} {}", code, reason);
                    self.disconnect(Some(code), Some(reason));
                }
            },
            Some(TransportEvent::Error(e)) => self.handle_transport_failure(e.is_network(), e.message),
            None => self.handle_transport_failure(true, "transport stopped".to_string()),
        }
    }

    fn handle_transport_failure(&mut self, network: bool, message: String) {
        warn!("Transport failure (network: {}): {}", network, message);
        self.emit(
            message::ERROR,
            json!({"type": "TransportError", "message": message}),
        );

        if !network {
            self.disconnect(Some(ABNORMAL_CLOSURE), Some(message));
            return;
        }
        if self.reconnect_attempts >= self.link.config.max_reconnection_attempts {
            warn!("{}", MAX_RECONNECTION_REASON);
            self.emit(
                message::ERROR,
                json!({"type": "ReconnectError", "message": MAX_RECONNECTION_REASON}),
            );
            self.disconnect(
                Some(ABNORMAL_CLOSURE),
                Some(MAX_RECONNECTION_REASON.to_string()),
            );
            return;
        }

        self.disconnect(Some(ABNORMAL_CLOSURE), Some(message));
        self.schedule_reconnect();
    }

    /// Enter `Reconnecting` and arm the gap timer. The caller checks the budget.
    fn schedule_reconnect(&mut self) {
        self.reconnect_attempts += 1;
        debug!(
            "Scheduling reconnection attempt {} of {} in {:?}",
            self.reconnect_attempts,
            self.link.config.max_reconnection_attempts,
            self.link.config.reconnect_gap
        );
        self.transition(
            ConnectionState::Reconnecting,
            json!({"attempt": self.reconnect_attempts}),
        );
        self.reconnect_timer.start(self.link.config.reconnect_gap);
    }

    fn handle_frame(&mut self, text: &str) {
        if self.link.config.enable_logging {
            trace!("Received message: {}", text);
        }

        let inbound = match message::decode_frame(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                error!("Failed to decode message: {} ({})", e, text);
                return;
            }
        };

        match inbound.event.as_str() {
            CONNECTION_ESTABLISHED => {
                if !self.handle_connection_established(&inbound.data) {
                    return;
                }
            }
            PONG => {
                self.pong_timer.stop();
                self.activity_timer.start(self.activity_timeout);
            }
            PING => {
                if let Err(e) = self.link.send(&message::pong_frame()) {
                    warn!("Failed to answer ping: {}", e);
                }
            }
            message::ERROR => match serde_json::from_value::<ErrorData>(inbound.data.clone()) {
                Ok(data) => error!("Pusher error: {} (code: {:?})", data.message, data.code),
                Err(_) => error!("Pusher error: {}", inbound.data),
            },
            _ => {}
        }

        let mut event = PusherEvent::new(
            inbound.event.clone(),
            inbound.channel.clone(),
            inbound.data.clone(),
        );
        event.user_id = inbound.user_id.clone();
        self.dispatcher.dispatch(&event);

        let Some(name) = inbound.channel.clone() else {
            return;
        };
        match self.registry.get_mut(&name) {
            Some(channel) => channel.handle_event(&mut self.link, inbound),
            None => trace!("No channel registered for {}", name),
        }
    }

    fn handle_connection_established(&mut self, data: &Value) -> bool {
        let connection = match serde_json::from_value::<ConnectionData>(data.clone()) {
            Ok(connection) => connection,
            Err(e) => {
                error!("Malformed connection_established: {}", e);
                return false;
            }
        };
        debug!(
            "Connection established with socket ID: {}",
            connection.socket_id
        );

        self.link.set_socket_id(Some(connection.socket_id));
        self.activity_timeout = match connection.activity_timeout {
            Some(seconds) if seconds > 0 => {
                self.link.config.activity_timeout.min(Duration::from_secs(seconds))
            }
            _ => self.link.config.activity_timeout,
        };

        let next = if self.link.state == ConnectionState::Reconnecting {
            ConnectionState::Reconnected
        } else {
            ConnectionState::Connected
        };
        self.transition(next, data.clone());

        self.pong_timer.stop();
        self.activity_timer.start(self.activity_timeout);

        debug!("Resubscribing {} channels", self.registry.len());
        let link = &mut self.link;
        self.registry.for_each(|channel| {
            trace!("Resubscribing {} ({:?})", channel.name(), channel.kind());
            channel.subscribe(&mut *link, true);
        });
        true
    }

    fn send_ping(&mut self) {
        if self.pong_timer.is_active() {
            return;
        }
        let device_id = uuid::Uuid::new_v4().to_string();
        debug!("Activity timeout elapsed, sending ping");
        if let Err(e) = self.link.send(&message::ping_frame(&device_id)) {
            warn!("Failed to send ping: {}", e);
        }
        self.pong_timer.start(self.link.config.pong_timeout);
    }

    fn handle_pong_timeout(&mut self) {
        warn!("No pong within {:?}", self.link.config.pong_timeout);
        self.emit(
            message::ERROR,
            json!({"type": "ActivityTimeout", "message": ACTIVITY_TIMEOUT_REASON}),
        );
        self.disconnect(None, Some(ACTIVITY_TIMEOUT_REASON.to_string()));
    }

    fn handle_auth_outcome(&mut self, outcome: AuthOutcome) {
        let AuthOutcome { request, result } = outcome;
        match self.registry.get_mut(&request.channel_name) {
            Some(channel) => channel.apply_auth(&mut self.link, &request.socket_id, result),
            None => debug!(
                "Auth result for {} arrived after unsubscribe",
                request.channel_name
            ),
        }
    }
}

async fn next_transport_event(socket: &mut Option<SocketSession>) -> Option<TransportEvent> {
    match socket {
        Some(socket) => socket.recv().await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_events_follow_state() {
        assert_eq!(ConnectionState::Connected.lifecycle_event(), "connected");
        assert_eq!(ConnectionState::Reconnected.lifecycle_event(), "reconnected");
        assert!(ConnectionState::Reconnected.is_connected());
        assert!(!ConnectionState::Reconnecting.is_connected());
    }

    #[test]
    fn state_serializes_for_state_change_events() {
        assert_eq!(
            serde_json::to_value(ConnectionState::Disconnecting).unwrap(),
            json!("DISCONNECTING")
        );
    }
}
