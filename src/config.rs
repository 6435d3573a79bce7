//! Configuration for the MQTT link
//!
//! The TOML file form ([`LinkConfig`]) names environment variables for every
//! credential; [`LinkConfig::resolve`] reads them and produces the immutable
//! [`LinkSettings`] the connection manager runs on.

use crate::link::subscriptions::Subscription;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Remote address the SSH server forwards tunnel traffic to
pub const DEFAULT_REMOTE_BIND_ADDRESS: &str = "127.0.0.1";

/// Complete link configuration as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkConfig {
    pub broker: BrokerSection,
    /// Absent section means the broker is reached directly
    pub tunnel: Option<TunnelSection>,
    #[serde(default)]
    pub timing: TimingSection,
    /// Subscriptions registered before the first connection
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionEntry>,
}

/// Broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker host; also the SSH host when tunnelling
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// Environment variable containing the broker username
    pub username_env: Option<String>,
    /// Environment variable containing the broker password
    pub password_env: Option<String>,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
}

fn default_broker_port() -> u16 {
    1883
}

fn default_client_id_prefix() -> String {
    "mqttlink".to_string()
}

/// SSH tunnel section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelSection {
    /// Environment variable containing the SSH username
    pub username_env: String,
    /// Environment variable containing the SSH password
    pub password_env: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_remote_bind_address")]
    pub remote_bind_address: String,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_remote_bind_address() -> String {
    DEFAULT_REMOTE_BIND_ADDRESS.to_string()
}

/// Timing knobs, all in milliseconds unless the name says otherwise
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingSection {
    pub poll_interval_ms: u64,
    pub retry_cooldown_ms: u64,
    pub connect_pump_ms: u64,
    pub connected_pump_ms: u64,
    pub shutdown_flush_ms: u64,
    pub stop_timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub broker_connect_timeout_ms: u64,
    pub tunnel_connect_timeout_ms: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            retry_cooldown_ms: 5000,
            connect_pump_ms: 100,
            connected_pump_ms: 1000,
            shutdown_flush_ms: 100,
            stop_timeout_ms: 2000,
            keep_alive_secs: 60,
            broker_connect_timeout_ms: 5000,
            tunnel_connect_timeout_ms: 10_000,
        }
    }
}

/// One `[[subscriptions]]` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionEntry {
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LinkConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: LinkConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.host must not be empty".to_string(),
            ));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.port must be greater than 0".to_string(),
            ));
        }
        if let Some(tunnel) = &self.tunnel {
            if tunnel.ssh_port == 0 {
                return Err(ConfigError::InvalidConfig(
                    "tunnel.ssh_port must be greater than 0".to_string(),
                ));
            }
            if tunnel.remote_bind_address.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "tunnel.remote_bind_address must not be empty".to_string(),
                ));
            }
        }

        self.timing.validate()?;

        for entry in &self.subscriptions {
            if entry.topic.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "subscription topic must not be empty".to_string(),
                ));
            }
            if entry.qos > 2 {
                return Err(ConfigError::InvalidConfig(format!(
                    "subscription '{}' has qos {}, expected 0, 1 or 2",
                    entry.topic, entry.qos
                )));
            }
        }

        Ok(())
    }

    /// Read credentials from the environment and build runtime settings
    ///
    /// A tunnel section whose variables are unset or empty resolves to a
    /// direct connection rather than an error.
    pub fn resolve(&self) -> LinkSettings {
        let ssh_credentials = self.tunnel.as_ref().and_then(|tunnel| {
            let username = std::env::var(&tunnel.username_env).ok()?;
            let password = std::env::var(&tunnel.password_env).ok()?;
            Some(Credentials::new(username, password))
        });

        let broker_username = read_optional_env(self.broker.username_env.as_deref());
        let broker_password = read_optional_env(self.broker.password_env.as_deref());

        let mut settings = LinkSettings::new(self.broker.host.clone());
        settings.broker_port = self.broker.port;
        settings.client_id_prefix = self.broker.client_id_prefix.clone();
        settings.ssh_credentials = ssh_credentials;
        settings.broker_credentials =
            broker_username.map(|user| Credentials::new(user, broker_password.unwrap_or_default()));
        if let Some(tunnel) = &self.tunnel {
            settings.ssh_port = tunnel.ssh_port;
            settings.remote_bind_address = tunnel.remote_bind_address.clone();
        }
        settings.timing = Timing::from(&self.timing);
        settings.initial_subscriptions = self
            .subscriptions
            .iter()
            .filter_map(|entry| Subscription::parse(entry.topic.as_bytes(), i64::from(entry.qos)))
            .collect();
        settings
    }
}

impl TimingSection {
    fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("retry_cooldown_ms", self.retry_cooldown_ms),
            ("connect_pump_ms", self.connect_pump_ms),
            ("connected_pump_ms", self.connected_pump_ms),
            ("stop_timeout_ms", self.stop_timeout_ms),
            ("keep_alive_secs", self.keep_alive_secs),
            ("broker_connect_timeout_ms", self.broker_connect_timeout_ms),
            ("tunnel_connect_timeout_ms", self.tunnel_connect_timeout_ms),
        ];
        for (name, value) in required {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "timing.{name} must be greater than 0"
                )));
            }
        }
        Ok(())
    }
}

fn read_optional_env(name: Option<&str>) -> Option<String> {
    name.and_then(|name| std::env::var(name).ok())
}

/// Username/password pair
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Runtime timing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Sleep between state machine ticks
    pub poll_interval: Duration,
    /// Wait in `Waiting` before a new tunnel attempt
    pub retry_cooldown: Duration,
    /// Transport pump while the broker handshake completes
    pub connect_pump: Duration,
    /// Transport pump per tick while connected
    pub connected_pump: Duration,
    /// Pause between broker disconnect and tunnel close on shutdown
    pub shutdown_flush: Duration,
    /// How long `shutdown` waits for the worker to exit
    pub stop_timeout: Duration,
    pub keep_alive: Duration,
    pub broker_connect_timeout: Duration,
    pub tunnel_connect_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self::from(&TimingSection::default())
    }
}

impl From<&TimingSection> for Timing {
    fn from(section: &TimingSection) -> Self {
        Self {
            poll_interval: Duration::from_millis(section.poll_interval_ms),
            retry_cooldown: Duration::from_millis(section.retry_cooldown_ms),
            connect_pump: Duration::from_millis(section.connect_pump_ms),
            connected_pump: Duration::from_millis(section.connected_pump_ms),
            shutdown_flush: Duration::from_millis(section.shutdown_flush_ms),
            stop_timeout: Duration::from_millis(section.stop_timeout_ms),
            keep_alive: Duration::from_secs(section.keep_alive_secs),
            broker_connect_timeout: Duration::from_millis(section.broker_connect_timeout_ms),
            tunnel_connect_timeout: Duration::from_millis(section.tunnel_connect_timeout_ms),
        }
    }
}

/// Resolved, immutable settings the connection manager runs on
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub host: String,
    pub broker_port: u16,
    pub broker_credentials: Option<Credentials>,
    pub ssh_credentials: Option<Credentials>,
    pub ssh_port: u16,
    pub remote_bind_address: String,
    pub client_id_prefix: String,
    pub timing: Timing,
    pub initial_subscriptions: Vec<Subscription>,
    /// When false the manager keeps its lifecycle events at debug level
    pub log_enabled: bool,
}

impl LinkSettings {
    /// Settings for a direct connection to `host` with all defaults
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            broker_port: default_broker_port(),
            broker_credentials: None,
            ssh_credentials: None,
            ssh_port: default_ssh_port(),
            remote_bind_address: default_remote_bind_address(),
            client_id_prefix: default_client_id_prefix(),
            timing: Timing::default(),
            initial_subscriptions: Vec::new(),
            log_enabled: true,
        }
    }

    pub fn with_broker_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.broker_credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn with_ssh_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.ssh_credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.initial_subscriptions.push(subscription);
        self
    }

    pub fn with_log_enabled(mut self, enabled: bool) -> Self {
        self.log_enabled = enabled;
        self
    }

    /// Tunnel credentials, only when both halves are present and non-empty
    pub fn tunnel_credentials(&self) -> Option<&Credentials> {
        self.ssh_credentials.as_ref().filter(|c| c.is_complete())
    }

    /// Whether connections are routed through an SSH tunnel
    pub fn uses_tunnel(&self) -> bool {
        self.tunnel_credentials().is_some()
    }
}
