//! Client for the Pusher real-time messaging protocol.
//!
//! A [`PusherClient`] keeps one socket to a Pusher-compatible server,
//! subscribes to public, private, presence and private-encrypted channels,
//! and delivers inbound events to listeners bound on the connection or on
//! individual channels. Transient network failures are retried a bounded
//! number of times.

pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod event;
pub mod message;
pub mod presence;
mod registry;
mod timer;
pub mod transport;

pub use auth::{AuthData, AuthRequest, Authorizer, EndpointAuthorizer, SecretAuthorizer, UserData};
pub use channel::{Channel, ChannelKind, ChannelStatus};
pub use client::PusherClient;
pub use config::ClientConfig;
pub use connection::ConnectionState;
pub use crypto::{Decryptor, SecretBoxDecryptor};
pub use error::PusherError;
pub use event::{ListenerId, PusherEvent};
pub use presence::Member;
pub use transport::{Transport, WebSocketTransport};
