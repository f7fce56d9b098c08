use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::error::PusherError;

pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const SUBSCRIBE: &str = "pusher:subscribe";
pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher:subscription_succeeded";
pub const SUBSCRIPTION_COUNT: &str = "pusher:subscription_count";
pub const MEMBER_ADDED: &str = "pusher:member_added";
pub const MEMBER_REMOVED: &str = "pusher:member_removed";
pub const PING: &str = "pusher:ping";
pub const PONG: &str = "pusher:pong";
pub const ERROR: &str = "pusher:error";

/// Prefix shared by all protocol-level events
pub const PUSHER_PREFIX: &str = "pusher:";
/// Prefix the server uses for internal events, normalized to [`PUSHER_PREFIX`]
pub const INTERNAL_PREFIX: &str = "pusher_internal:";
/// Prefix required on events triggered by clients
pub const CLIENT_EVENT_PREFIX: &str = "client-";

/// Pusher protocol message structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PusherMessage {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl PusherMessage {
    pub fn new(event: impl Into<String>, data: Value, channel: Option<String>) -> Self {
        Self {
            event: event.into(),
            data,
            channel,
            user_id: None,
        }
    }

    /// Serialize to the JSON text written on the socket
    pub fn to_text(&self) -> Result<String, PusherError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether this is a protocol event rather than an application event
    pub fn is_internal(&self) -> bool {
        self.event.starts_with(PUSHER_PREFIX)
    }
}

/// Connection data received after establishing connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionData {
    pub socket_id: String,
    #[serde(default)]
    pub activity_timeout: Option<u64>,
}

/// Error data structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub code: Option<u32>,
    #[serde(default)]
    pub message: String,
}

/// Decode one inbound text frame.
///
/// The frame must be a JSON object with a string `event`. The server's
/// `pusher_internal:` prefix is rewritten to `pusher:`, and a `data` field
/// that is itself JSON-encoded text is parsed one level further. Text that
/// fails that second parse is kept as a plain string.
pub fn decode_frame(text: &str) -> Result<PusherMessage, PusherError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(mut object) = value else {
        return Err(PusherError::ProtocolError(
            "frame is not a JSON object".to_string(),
        ));
    };

    let event = match object.remove("event") {
        Some(Value::String(event)) => event,
        _ => {
            return Err(PusherError::ProtocolError(
                "frame has no event field".to_string(),
            ));
        }
    };
    let event = match event.strip_prefix(INTERNAL_PREFIX) {
        Some(rest) => format!("{PUSHER_PREFIX}{rest}"),
        None => event,
    };

    let data = match object.remove("data") {
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Data of {} is not valid JSON, delivering raw string: {}", event, e);
                Value::String(raw)
            }
        },
        Some(other) => other,
        None => Value::Null,
    };

    let channel = match object.remove("channel") {
        Some(Value::String(channel)) => Some(channel),
        _ => None,
    };
    let user_id = match object.remove("user_id") {
        Some(Value::String(user_id)) => Some(user_id),
        Some(Value::Number(user_id)) => Some(user_id.to_string()),
        _ => None,
    };

    Ok(PusherMessage {
        event,
        data,
        channel,
        user_id,
    })
}

/// Build a `pusher:subscribe` frame. Authenticated channels always carry
/// `auth` and `channel_data` (null when the auth response had none).
pub fn subscribe_frame(channel: &str, auth: Option<(&str, Option<&str>)>) -> PusherMessage {
    let mut data = Map::new();
    data.insert("channel".to_string(), Value::from(channel));
    if let Some((token, channel_data)) = auth {
        data.insert("auth".to_string(), Value::from(token));
        data.insert(
            "channel_data".to_string(),
            channel_data.map(Value::from).unwrap_or(Value::Null),
        );
    }
    PusherMessage::new(SUBSCRIBE, Value::Object(data), None)
}

pub fn unsubscribe_frame(channel: &str) -> PusherMessage {
    PusherMessage::new(UNSUBSCRIBE, json!({ "channel": channel }), None)
}

pub fn ping_frame(device_id: &str) -> PusherMessage {
    PusherMessage::new(PING, json!({ "device_id": device_id }), None)
}

pub fn pong_frame() -> PusherMessage {
    PusherMessage::new(PONG, json!({}), None)
}

/// Prefix an event name with `client-` unless it already has it
pub fn client_event_name(event: &str) -> String {
    if event.starts_with(CLIENT_EVENT_PREFIX) {
        event.to_string()
    } else {
        format!("{CLIENT_EVENT_PREFIX}{event}")
    }
}
