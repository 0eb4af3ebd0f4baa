//! Client configuration
//!
//! Loaded from YAML; every field has a default so an empty document is a
//! valid public-endpoint config. Credentials are never read from the file,
//! see [`crate::auth::Credentials::from_env`].

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::{OverflowPolicy, PipelineOptions};

/// Header that routes a connection to the demo-trading environment.
pub const SIMULATED_HEADER: &str = "x-simulated-trading";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Which streaming endpoint to connect to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    #[default]
    Public,
    /// Account, order and position channels; login is mandatory
    Private,
    /// Candles, trades-all and algo channels; login when credentials are set
    Business,
}

impl Endpoint {
    pub fn label(self) -> &'static str {
        match self {
            Endpoint::Public => "public",
            Endpoint::Private => "private",
            Endpoint::Business => "business",
        }
    }

    pub fn requires_login(self) -> bool {
        matches!(self, Endpoint::Private)
    }

    pub fn default_url(self, simulated: bool) -> String {
        let host = if simulated {
            "wss://wspap.okx.com:8443"
        } else {
            "wss://ws.okx.com:8443"
        };
        format!("{}/ws/v5/{}", host, self.label())
    }
}

/// Dispatch queue settings, shared by the raw and typed pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    /// Run typed callbacks inline on the read loop
    pub synchronous: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            overflow: OverflowPolicy::Drop,
            synchronous: false,
        }
    }
}

impl DispatchConfig {
    pub fn options(&self, synchronous: bool) -> PipelineOptions {
        PipelineOptions {
            capacity: self.capacity,
            overflow: self.overflow,
            synchronous,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    /// Overrides the endpoint's default URL
    pub url: Option<String>,
    pub simulated: bool,
    /// Extra headers sent with the websocket handshake
    pub headers: BTreeMap<String, String>,
    pub handshake_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub login_timeout_ms: u64,
    /// Reconnect when nothing arrives for this long
    pub read_timeout_ms: u64,
    /// Send a text `ping` after this much inbound silence
    pub heartbeat_interval_ms: Option<u64>,
    pub resubscribe_wait_timeout_ms: u64,
    pub backoff_floor_ms: u64,
    pub backoff_ceiling_ms: u64,
    /// Resubscribe a book topic after a sequence or checksum failure
    pub auto_resync_books: bool,
    pub rest_url: String,
    /// Fetch server time over REST before each login
    pub sync_server_time: bool,
    pub dispatch: DispatchConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::Public,
            url: None,
            simulated: false,
            headers: BTreeMap::new(),
            handshake_timeout_ms: 10_000,
            write_timeout_ms: 5_000,
            login_timeout_ms: 10_000,
            read_timeout_ms: 60_000,
            heartbeat_interval_ms: None,
            resubscribe_wait_timeout_ms: 10_000,
            backoff_floor_ms: 500,
            backoff_ceiling_ms: 30_000,
            auto_resync_books: true,
            rest_url: "https://www.okx.com".to_string(),
            sync_server_time: false,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load and validate a YAML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn for_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.capacity == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.capacity must be greater than zero".to_string(),
            ));
        }
        let timeouts = [
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("login_timeout_ms", self.login_timeout_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("resubscribe_wait_timeout_ms", self.resubscribe_wait_timeout_ms),
            ("backoff_floor_ms", self.backoff_floor_ms),
            (
                "heartbeat_interval_ms",
                self.heartbeat_interval_ms.unwrap_or(1),
            ),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero",
                name
            )));
        }
        if self.backoff_ceiling_ms < self.backoff_floor_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff_ceiling_ms ({}) is below backoff_floor_ms ({})",
                self.backoff_ceiling_ms, self.backoff_floor_ms
            )));
        }
        if let Some(url) = &self.url {
            url::Url::parse(url)
                .map_err(|e| ConfigError::Invalid(format!("url {}: {}", url, e)))?;
        }
        Ok(())
    }

    pub fn url(&self) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| self.endpoint.default_url(self.simulated))
    }

    /// Configured headers plus the demo-trading header when simulated.
    pub fn handshake_headers(&self) -> BTreeMap<String, String> {
        let mut headers = self.headers.clone();
        if self.simulated {
            headers.insert(SIMULATED_HEADER.to_string(), "1".to_string());
        }
        headers
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms.map(Duration::from_millis)
    }

    pub fn resubscribe_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.resubscribe_wait_timeout_ms)
    }
}
