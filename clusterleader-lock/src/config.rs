use std::{env, fs, time::Duration};

use tracing::warn;

pub const HTTP_ADDR_ENV: &str = "CONSUL_HTTP_ADDR";
pub const HTTP_TOKEN_ENV: &str = "CONSUL_HTTP_TOKEN";
pub const HTTP_TOKEN_FILE_ENV: &str = "CONSUL_HTTP_TOKEN_FILE";
pub const HTTP_SSL_ENV: &str = "CONSUL_HTTP_SSL";

const DEFAULT_ADDRESS: &str = "127.0.0.1:8500";

/// Connection settings for a Consul agent.
#[derive(Debug, Clone)]
pub struct ConsulConfig {
    /// host:port of the agent
    pub address: String,
    pub scheme: String,
    /// ACL token sent with every request
    pub token: Option<String>,
    pub datacenter: Option<String>,
    pub connect_timeout: Duration,
    pub tcp_keepalive: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_owned(),
            scheme: "http".to_owned(),
            token: None,
            datacenter: None,
            connect_timeout: Duration::from_secs(30),
            tcp_keepalive: Duration::from_secs(15),
        }
    }
}

impl ConsulConfig {
    /// Defaults overridden by the standard `CONSUL_HTTP_*` variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = env::var(HTTP_ADDR_ENV) {
            config.set_address(&addr);
        }
        if let Ok(path) = env::var(HTTP_TOKEN_FILE_ENV) {
            match fs::read_to_string(&path) {
                Ok(token) => config.token = Some(token.trim().to_owned()),
                Err(err) => warn!(?err, path, "reading consul token file"),
            }
        }
        if let Ok(token) = env::var(HTTP_TOKEN_ENV) {
            config.token = Some(token);
        }
        if let Ok(ssl) = env::var(HTTP_SSL_ENV) {
            match ssl.parse::<bool>() {
                Ok(true) => config.scheme = "https".to_owned(),
                Ok(false) => config.scheme = "http".to_owned(),
                Err(_) => warn!(ssl, "invalid {}", HTTP_SSL_ENV),
            }
        }
        config
    }

    /// Set the agent address, accepting an optional `http://` or `https://`
    /// prefix.
    pub fn set_address(&mut self, addr: &str) {
        let addr = addr.trim_end_matches('/');
        if let Some(rest) = addr.strip_prefix("https://") {
            self.scheme = "https".to_owned();
            self.address = rest.to_owned();
        } else if let Some(rest) = addr.strip_prefix("http://") {
            self.scheme = "http".to_owned();
            self.address = rest.to_owned();
        } else {
            self.address = addr.to_owned();
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.address)
    }
}

/// Settings for one election engine.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Lock key contended for leadership
    pub key: String,

    /// Identity of this node, stored as the lock value
    pub node: String,

    /// Session TTL and the fixed delay between failed attempts
    pub wait_time: Duration,

    /// Errors buffered for the error stream before the oldest are dropped
    pub error_capacity: usize,
}

impl ElectionConfig {
    pub fn new(key: impl Into<String>, node: impl Into<String>, wait_time: Duration) -> Self {
        Self {
            key: key.into(),
            node: node.into(),
            wait_time,
            error_capacity: 16,
        }
    }
}
