use thiserror::Error;

/// Error types for the pusher-rs library
#[derive(Error, Debug)]
pub enum PusherError {
    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Channel authentication failed with status {0}")]
    AuthStatus(u16),
    #[error("Invalid auth response: {0}")]
    AuthFormat(String),
    #[error("Channel authentication failed: {0}")]
    AuthError(String),
    #[error("Decryption failed: {0}")]
    DecryptionError(String),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
    #[error("Send error: {0}")]
    SendError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}
