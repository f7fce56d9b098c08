use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::auth::{Authorizer, EndpointAuthorizer};
use crate::crypto::{Decryptor, SecretBoxDecryptor};
use crate::error::PusherError;

/// Wire protocol version spoken by this client
pub const PROTOCOL_VERSION: u8 = 7;
pub const CLIENT_NAME: &str = "pusher-rs";
pub const DEFAULT_CLUSTER: &str = "mt1";

/// Client configuration, assembled with `with_*` builder methods
#[derive(Clone)]
pub struct ClientConfig {
    pub app_key: String,
    pub host: String,
    /// Full endpoint overriding host, ports and scheme
    pub url: Option<String>,
    pub use_tls: bool,
    pub ws_port: u16,
    pub wss_port: u16,
    pub activity_timeout: Duration,
    pub pong_timeout: Duration,
    pub query_params: IndexMap<String, String>,
    pub auth_endpoint: Option<String>,
    pub auth_headers: HashMap<String, String>,
    pub auth_params: HashMap<String, String>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub decryptor: Option<Arc<dyn Decryptor>>,
    pub max_reconnection_attempts: u32,
    pub reconnect_gap: Duration,
    /// Log raw frames at trace level
    pub enable_logging: bool,
}

impl ClientConfig {
    pub fn new(app_key: &str) -> Self {
        Self {
            app_key: app_key.to_string(),
            host: cluster_host(DEFAULT_CLUSTER),
            url: None,
            use_tls: true,
            ws_port: 80,
            wss_port: 443,
            activity_timeout: Duration::from_secs(120),
            pong_timeout: Duration::from_secs(30),
            query_params: IndexMap::new(),
            auth_endpoint: None,
            auth_headers: HashMap::new(),
            auth_params: HashMap::new(),
            authorizer: None,
            decryptor: None,
            max_reconnection_attempts: 6,
            reconnect_gap: Duration::from_secs(2),
            enable_logging: true,
        }
    }

    /// Connect to the hosted cluster, e.g. `eu` or `ap1`
    pub fn with_cluster(mut self, cluster: &str) -> Self {
        self.host = cluster_host(cluster);
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Use a complete `ws://` or `wss://` endpoint instead of host and ports
    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_ports(mut self, ws_port: u16, wss_port: u16) -> Self {
        self.ws_port = ws_port;
        self.wss_port = wss_port;
        self
    }

    pub fn with_activity_timeout(mut self, timeout: Duration) -> Self {
        self.activity_timeout = timeout;
        self
    }

    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    pub fn with_query_param(mut self, key: &str, value: &str) -> Self {
        self.query_params.insert(key.to_string(), value.to_string());
        self
    }

    /// Set authentication endpoint
    pub fn with_auth_endpoint(mut self, endpoint: &str) -> Self {
        self.auth_endpoint = Some(endpoint.to_string());
        self
    }

    pub fn with_auth_header(mut self, name: &str, value: &str) -> Self {
        self.auth_headers.insert(name.to_string(), value.to_string());
        self
    }

    /// Extra identifier field merged into every auth request body
    pub fn with_auth_param(mut self, key: &str, value: &str) -> Self {
        self.auth_params.insert(key.to_string(), value.to_string());
        self
    }

    /// Use a custom authorizer instead of the HTTP endpoint
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn with_decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    pub fn with_max_reconnection_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnection_attempts = attempts;
        self
    }

    pub fn with_reconnect_gap(mut self, gap: Duration) -> Self {
        self.reconnect_gap = gap;
        self
    }

    pub fn with_logging(mut self, enable_logging: bool) -> Self {
        self.enable_logging = enable_logging;
        self
    }

    pub fn validate(&self) -> Result<(), PusherError> {
        if self.app_key.trim().is_empty() {
            return Err(PusherError::ConfigError("app key is empty".to_string()));
        }
        if self.activity_timeout.is_zero() || self.pong_timeout.is_zero() {
            return Err(PusherError::ConfigError(
                "activity and pong timeouts must be positive".to_string(),
            ));
        }
        self.url()?;
        Ok(())
    }

    /// The socket endpoint, including protocol and custom query parameters
    pub fn url(&self) -> Result<Url, PusherError> {
        let mut url = match &self.url {
            Some(url) => Url::parse(url)?,
            None => {
                let (scheme, port) = if self.use_tls {
                    ("wss", self.wss_port)
                } else {
                    ("ws", self.ws_port)
                };
                Url::parse(&format!(
                    "{}://{}:{}/app/{}",
                    scheme, self.host, port, self.app_key
                ))?
            }
        };

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("protocol", &PROTOCOL_VERSION.to_string())
                .append_pair("client", CLIENT_NAME)
                .append_pair("version", env!("CARGO_PKG_VERSION"));
            for (key, value) in &self.query_params {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// The authorizer in effect: an explicit one, else the HTTP endpoint
    pub fn resolve_authorizer(&self) -> Option<Arc<dyn Authorizer>> {
        if let Some(authorizer) = &self.authorizer {
            return Some(Arc::clone(authorizer));
        }
        self.auth_endpoint.as_deref().map(|endpoint| {
            Arc::new(
                EndpointAuthorizer::new(endpoint, &self.app_key)
                    .with_headers(self.auth_headers.clone())
                    .with_params(self.auth_params.clone()),
            ) as Arc<dyn Authorizer>
        })
    }

    pub fn resolve_decryptor(&self) -> Arc<dyn Decryptor> {
        self.decryptor
            .clone()
            .unwrap_or_else(|| Arc::new(SecretBoxDecryptor))
    }
}

fn cluster_host(cluster: &str) -> String {
    format!("ws-{cluster}.pusher.com")
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("app_key", &self.app_key)
            .field("host", &self.host)
            .field("url", &self.url)
            .field("use_tls", &self.use_tls)
            .field("ws_port", &self.ws_port)
            .field("wss_port", &self.wss_port)
            .field("activity_timeout", &self.activity_timeout)
            .field("pong_timeout", &self.pong_timeout)
            .field("query_params", &self.query_params)
            .field("auth_endpoint", &self.auth_endpoint)
            .field("custom_authorizer", &self.authorizer.is_some())
            .field("custom_decryptor", &self.decryptor.is_some())
            .field("max_reconnection_attempts", &self.max_reconnection_attempts)
            .field("reconnect_gap", &self.reconnect_gap)
            .field("enable_logging", &self.enable_logging)
            .finish()
    }
}
