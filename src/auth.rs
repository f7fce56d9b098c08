use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use reqwest::Client as HttpClient;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;

use crate::channel::ChannelKind;
use crate::error::PusherError;

/// Presence identity carried in `channel_data`
#[derive(Debug, Clone, PartialEq)]
pub struct UserData {
    pub user_id: String,
    pub user_info: Value,
}

impl UserData {
    /// Parse the JSON-encoded `channel_data` string of an auth response
    pub fn from_channel_data(channel_data: &str) -> Result<Self, PusherError> {
        let value: Value = serde_json::from_str(channel_data)
            .map_err(|e| PusherError::AuthFormat(format!("channel_data is not JSON: {e}")))?;
        let user_id = match value.get("user_id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                return Err(PusherError::AuthFormat(
                    "channel_data has no user_id".to_string(),
                ));
            }
        };
        Ok(Self {
            user_id,
            user_info: value.get("user_info").cloned().unwrap_or(Value::Null),
        })
    }
}

/// Result of a successful channel authorization
#[derive(Debug, Clone, PartialEq)]
pub struct AuthData {
    pub auth: String,
    /// `channel_data` exactly as received, forwarded verbatim in the subscribe frame
    pub channel_data: Option<String>,
    pub user_data: Option<UserData>,
    /// Base64 key for `private-encrypted-` channels
    pub shared_secret: Option<String>,
}

impl AuthData {
    /// Parse the JSON body returned by an auth endpoint
    pub fn from_response(body: &str) -> Result<Self, PusherError> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| PusherError::AuthFormat(format!("response is not JSON: {e}")))?;

        let auth = value
            .get("auth")
            .and_then(Value::as_str)
            .ok_or_else(|| PusherError::AuthFormat("response has no auth key".to_string()))?
            .to_string();

        let channel_data = value
            .get("channel_data")
            .and_then(Value::as_str)
            .map(str::to_string);
        let user_data = channel_data
            .as_deref()
            .map(UserData::from_channel_data)
            .transpose()?;

        Ok(Self {
            auth,
            channel_data,
            user_data,
            shared_secret: value
                .get("shared_secret")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_data.as_ref().map(|user| user.user_id.as_str())
    }
}

/// What is being authorized: one socket on one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub channel_name: String,
    pub socket_id: String,
}

/// Authorizes subscriptions to private, presence and encrypted channels
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, request: &AuthRequest) -> Result<AuthData, PusherError>;
}

/// Authorizes against an application-operated HTTP endpoint
#[derive(Debug, Clone)]
pub struct EndpointAuthorizer {
    http_client: HttpClient,
    endpoint: String,
    app_key: String,
    headers: HashMap<String, String>,
    params: HashMap<String, String>,
}

impl EndpointAuthorizer {
    pub fn new(endpoint: &str, app_key: &str) -> Self {
        Self {
            http_client: HttpClient::new(),
            endpoint: endpoint.to_string(),
            app_key: app_key.to_string(),
            headers: HashMap::new(),
            params: HashMap::new(),
        }
    }

    /// Add headers sent with every auth request
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Add extra identifier fields merged into every form body
    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn with_http_client(mut self, http_client: HttpClient) -> Self {
        self.http_client = http_client;
        self
    }
}

#[async_trait]
impl Authorizer for EndpointAuthorizer {
    async fn authorize(&self, request: &AuthRequest) -> Result<AuthData, PusherError> {
        let mut form: HashMap<&str, &str> = self
            .params
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        form.insert("channel_name", &request.channel_name);
        form.insert("socket_id", &request.socket_id);

        let mut builder = self.http_client.post(&self.endpoint);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }

        debug!(
            "Requesting auth for {} from {}",
            request.channel_name, self.endpoint
        );
        let response = builder
            .header("x-app-key", &self.app_key)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() != 200 {
            return Err(PusherError::AuthStatus(status.as_u16()));
        }

        AuthData::from_response(&response.text().await?)
    }
}

/// Signs subscriptions locally with the application secret.
///
/// Only suitable where the secret may live alongside the client, such as
/// server-side workers and tests.
#[derive(Debug, Clone)]
pub struct SecretAuthorizer {
    app_key: String,
    app_secret: String,
    user_data: Option<Value>,
    encryption_master_key: Option<Vec<u8>>,
}

impl SecretAuthorizer {
    pub fn new(app_key: &str, app_secret: &str) -> Self {
        Self {
            app_key: app_key.to_string(),
            app_secret: app_secret.to_string(),
            user_data: None,
            encryption_master_key: None,
        }
    }

    /// User data (`{"user_id": ..., "user_info": ...}`) presented on presence channels
    pub fn with_user_data(mut self, user_data: Value) -> Self {
        self.user_data = Some(user_data);
        self
    }

    /// Base64 master key from which per-channel shared secrets are derived
    pub fn with_encryption_master_key(mut self, master_key: &str) -> Result<Self, PusherError> {
        let key = STANDARD
            .decode(master_key)
            .map_err(|e| PusherError::ConfigError(format!("invalid encryption master key: {e}")))?;
        self.encryption_master_key = Some(key);
        Ok(self)
    }

    fn sign(&self, payload: &str) -> Result<String, PusherError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.app_secret.as_bytes())
            .map_err(|_| PusherError::AuthError("HMAC creation failed".to_string()))?;
        mac.update(payload.as_bytes());
        // Auth format: app_key:hex_encoded_hmac
        Ok(format!(
            "{}:{}",
            self.app_key,
            hex::encode(mac.finalize().into_bytes())
        ))
    }

    fn shared_secret(&self, channel_name: &str) -> Result<String, PusherError> {
        let master_key = self.encryption_master_key.as_ref().ok_or_else(|| {
            PusherError::AuthError("No encryption master key configured".to_string())
        })?;
        let mut hasher = Sha256::new();
        hasher.update(channel_name.as_bytes());
        hasher.update(master_key);
        Ok(STANDARD.encode(hasher.finalize()))
    }
}

#[async_trait]
impl Authorizer for SecretAuthorizer {
    async fn authorize(&self, request: &AuthRequest) -> Result<AuthData, PusherError> {
        match ChannelKind::from_name(&request.channel_name) {
            ChannelKind::Presence => {
                let user_data = self.user_data.as_ref().ok_or_else(|| {
                    PusherError::AuthError("Presence channels require user data".to_string())
                })?;
                let channel_data = serde_json::to_string(user_data)?;
                // Format: socket_id:channel_name:channel_data
                let auth = self.sign(&format!(
                    "{}:{}:{}",
                    request.socket_id, request.channel_name, channel_data
                ))?;
                Ok(AuthData {
                    auth,
                    user_data: Some(UserData::from_channel_data(&channel_data)?),
                    channel_data: Some(channel_data),
                    shared_secret: None,
                })
            }
            kind => {
                // Format: socket_id:channel_name
                let auth = self.sign(&format!("{}:{}", request.socket_id, request.channel_name))?;
                let shared_secret = if kind == ChannelKind::PrivateEncrypted {
                    Some(self.shared_secret(&request.channel_name)?)
                } else {
                    None
                };
                Ok(AuthData {
                    auth,
                    channel_data: None,
                    user_data: None,
                    shared_secret,
                })
            }
        }
    }
}
