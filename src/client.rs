use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::connection::{Command, CommandSender, ConnectionState, Session};
use crate::error::PusherError;
use crate::event::{ListenerId, PusherEvent};
use crate::transport::{Transport, WebSocketTransport};

/// Main client for connecting to a Pusher-protocol server.
///
/// The client is a handle to a connection task spawned on the current Tokio
/// runtime. Clones share the same connection; the task shuts down once the
/// last client and channel handle is dropped.
#[derive(Clone)]
pub struct PusherClient {
    commands: CommandSender,
    state: watch::Receiver<ConnectionState>,
    socket_id: watch::Receiver<Option<String>>,
}

impl PusherClient {
    /// Create a client using the WebSocket transport
    pub fn new(config: ClientConfig) -> Result<Self, PusherError> {
        Self::with_transport(config, Arc::new(WebSocketTransport::new()))
    }

    /// Create a client over a custom socket transport
    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, PusherError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            PusherError::ConfigError("PusherClient must be created inside a Tokio runtime".to_string())
        })?;

        let (commands, receiver) = mpsc::unbounded_channel();
        let (session, watch) = Session::new(Arc::new(config), transport, receiver);
        runtime.spawn(session.run());

        Ok(Self {
            commands,
            state: watch.state,
            socket_id: watch.socket_id,
        })
    }

    fn send(&self, command: Command) -> Result<(), PusherError> {
        self.commands
            .send(command)
            .map_err(|_| PusherError::ConnectionError("connection task has stopped".to_string()))
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, PusherError> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply))?;
        response
            .await
            .map_err(|_| PusherError::ConnectionError("connection task has stopped".to_string()))
    }

    /// Open the socket. Any existing socket is discarded first.
    pub fn connect(&self) -> Result<(), PusherError> {
        self.send(Command::Connect)
    }

    /// Close the socket. Calling this while disconnected does nothing.
    pub fn disconnect(&self) -> Result<(), PusherError> {
        self.disconnect_with(None, None)
    }

    pub fn disconnect_with(&self, code: Option<u16>, reason: Option<&str>) -> Result<(), PusherError> {
        self.send(Command::Disconnect {
            code,
            reason: reason.map(str::to_string),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe connection state transitions
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the connection reaches a state matching `predicate`
    pub async fn wait_for_state(
        &self,
        predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> Result<ConnectionState, PusherError> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(predicate)
            .await
            .map_err(|_| PusherError::ConnectionError("connection task has stopped".to_string()))?;
        Ok(*reached)
    }

    /// Server-assigned id of the current socket
    pub fn socket_id(&self) -> Option<String> {
        self.socket_id.borrow().clone()
    }

    /// Send a raw protocol event. Fails if no socket is open.
    pub async fn send_event(
        &self,
        event: &str,
        data: Value,
        channel: Option<&str>,
    ) -> Result<(), PusherError> {
        self.request(|reply| Command::SendEvent {
            event: event.to_string(),
            data,
            channel: channel.map(str::to_string),
            reply,
        })
        .await?
    }

    /// Get a handle to a channel, creating it unsubscribed if needed
    pub async fn channel(&self, name: &str) -> Result<Channel, PusherError> {
        let status = self
            .request(|reply| Command::Channel {
                name: name.to_string(),
                reply,
            })
            .await?;
        Ok(Channel::new(name.to_string(), self.commands.clone(), status))
    }

    /// Subscribe to a channel.
    ///
    /// Returns once the request is queued. Private, presence and encrypted
    /// channels finish subscribing only after authorization and the server's
    /// acknowledgement; await [`Channel::wait_subscribed`] to observe that.
    pub async fn subscribe(&self, name: &str) -> Result<Channel, PusherError> {
        let status = self
            .request(|reply| Command::Subscribe {
                name: name.to_string(),
                reply: Some(reply),
            })
            .await?;
        Ok(Channel::new(name.to_string(), self.commands.clone(), status))
    }

    pub fn unsubscribe(&self, name: &str) -> Result<(), PusherError> {
        self.send(Command::Unsubscribe {
            name: name.to_string(),
        })
    }

    pub fn unsubscribe_all(&self) -> Result<(), PusherError> {
        self.send(Command::UnsubscribeAll)
    }

    /// Listen for an event on the connection, whatever its channel
    pub fn bind_global<F>(&self, event: &str, listener: F) -> Result<ListenerId, PusherError>
    where
        F: Fn(&PusherEvent) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.send(Command::Bind {
            channel: None,
            event: event.to_string(),
            id,
            listener: Arc::new(listener),
        })?;
        Ok(id)
    }

    pub fn unbind_global(&self, event: &str) -> Result<(), PusherError> {
        self.send(Command::Unbind {
            channel: None,
            event: event.to_string(),
        })
    }

    pub fn unbind_global_listener(&self, id: ListenerId) -> Result<(), PusherError> {
        self.send(Command::UnbindListener { channel: None, id })
    }
}

impl std::fmt::Debug for PusherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PusherClient")
            .field("state", &*self.state.borrow())
            .field("socket_id", &*self.socket_id.borrow())
            .finish()
    }
}
