// Configuration for relay clients and the relay broker

use crate::relay::error::{RelayError, RelayResult};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BROKER_PORT: u16 = 61616;

/// PEM material a client presents to a TLS-enabled broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Trust anchors used to verify the broker certificate
    pub ca_certificate: PathBuf,
    /// Client certificate chain (leaf first)
    pub certificate_chain: PathBuf,
    pub private_key: PathBuf,
    /// Name checked against the broker certificate; defaults to the host
    #[serde(default)]
    pub server_name: Option<String>,
}

/// PEM material the broker serves with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsServerConfig {
    pub certificate_chain: PathBuf,
    pub private_key: PathBuf,
    /// When set, clients must present a certificate signed by this CA
    #[serde(default)]
    pub client_ca: Option<PathBuf>,
}

/// Settings of one cloud's relay client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayClientConfig {
    /// Common name of the local cloud, used in queue names
    pub common_name: String,
    /// PKCS#8 PEM private key of the local cloud
    pub key_path: PathBuf,
    /// Per-phase protocol timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl RelayClientConfig {
    pub fn new(common_name: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            common_name: common_name.into(),
            key_path: key_path.into(),
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            tls: None,
        }
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: &Path) -> RelayResult<Self> {
        let config: Self = read_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RelayResult<()> {
        if self.common_name.trim().is_empty() {
            return Err(RelayError::Config("common_name must not be empty".to_string()));
        }
        if self.common_name.contains(char::is_whitespace) {
            return Err(RelayError::Config(format!(
                "common_name contains whitespace: {:?}",
                self.common_name
            )));
        }
        if self.timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(RelayError::Config("timeouts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Settings of the relay broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// How long a queued message waits for a consumer
    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default)]
    pub tls: Option<TlsServerConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            message_ttl_secs: default_message_ttl_secs(),
            max_queue_size: default_max_queue_size(),
            tls: None,
        }
    }
}

impl BrokerConfig {
    /// Broker on an ephemeral local port, for tests and demos
    pub fn local() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            ..Self::default()
        }
    }

    pub fn from_file(path: &Path) -> RelayResult<Self> {
        let config: Self = read_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RelayResult<()> {
        if self.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(RelayError::Config(format!(
                "invalid bind address: {}",
                self.bind_address
            )));
        }
        if self.message_ttl_secs == 0 {
            return Err(RelayError::Config("message_ttl_secs must be positive".to_string()));
        }
        if self.max_queue_size == 0 {
            return Err(RelayError::Config("max_queue_size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_secs)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> RelayResult<T> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| RelayError::Config(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| RelayError::Config(format!("invalid config {}: {e}", path.display())))
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_bind_address() -> String {
    format!("0.0.0.0:{DEFAULT_BROKER_PORT}")
}

fn default_message_ttl_secs() -> u64 {
    300
}

fn default_max_queue_size() -> usize {
    1000
}
