//! Gateway configuration.
//!
//! Sources, lowest to highest priority: built-in defaults, a TOML file,
//! then environment variables.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default values.
pub mod defaults {
    pub const SERVICE_NAME: &str = "fieldlink";
    pub const MQTT_HOST: &str = "localhost";
    pub const MQTT_PORT: u16 = 1883;
    pub const KEEP_ALIVE_SECS: u64 = 60;
    pub const RECONNECT_PERIOD_MS: u64 = 5000;
    pub const CONNECT_TIMEOUT_SECS: u64 = 30;
    pub const STATUS_TOPIC: &str = "fieldlink/status";
    pub const REQUEST_CHANNEL_CAPACITY: usize = 64;
    pub const COMMAND_PREFIX: &str = "cmd";
    pub const RESPONSE_PREFIX: &str = "resp";
    pub const REGISTER_TOPIC: &str = "register";
    pub const ACK_TIMEOUT_MS: u64 = 10_000;
    pub const PENDING_TTL_SECS: u64 = 300;
    pub const REAPER_INTERVAL_SECS: u64 = 30;
    pub const STORAGE_BACKEND: &str = "memory";
    pub const STORAGE_PATH: &str = "data/fieldlink.redb";
    pub const CONFIG_FILE: &str = "config.toml";
}

/// Environment variable names.
pub mod env_vars {
    pub const CONFIG: &str = "FIELDLINK_CONFIG";
    pub const MQTT_HOST: &str = "FIELDLINK_MQTT_HOST";
    pub const MQTT_PORT: &str = "FIELDLINK_MQTT_PORT";
    pub const MQTT_USERNAME: &str = "FIELDLINK_MQTT_USERNAME";
    pub const MQTT_PASSWORD: &str = "FIELDLINK_MQTT_PASSWORD";
    pub const STORAGE_PATH: &str = "FIELDLINK_STORAGE_PATH";
    pub const LOG_JSON: &str = "FIELDLINK_LOG_JSON";
}

/// Storage backends the gateway knows how to open.
pub const STORAGE_BACKENDS: &[&str] = &["memory", "redb"];

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Service name, used in the client id and the last-will payload.
    pub service_name: String,
    pub mqtt: MqttSettings,
    pub topics: TopicSettings,
    pub commands: CommandSettings,
    pub storage: StorageSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            service_name: defaults::SERVICE_NAME.to_string(),
            mqtt: MqttSettings::default(),
            topics: TopicSettings::default(),
            commands: CommandSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    /// Client id base; the process id and a random suffix are appended.
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub reconnect_period_ms: u64,
    pub connect_timeout_secs: u64,
    pub clean_session: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Topic for the last-will and online status messages.
    pub status_topic: String,
    pub request_channel_capacity: usize,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: defaults::MQTT_HOST.to_string(),
            port: defaults::MQTT_PORT,
            client_id: defaults::SERVICE_NAME.to_string(),
            keep_alive_secs: defaults::KEEP_ALIVE_SECS,
            reconnect_period_ms: defaults::RECONNECT_PERIOD_MS,
            connect_timeout_secs: defaults::CONNECT_TIMEOUT_SECS,
            clean_session: true,
            username: None,
            password: None,
            status_topic: defaults::STATUS_TOPIC.to_string(),
            request_channel_capacity: defaults::REQUEST_CHANNEL_CAPACITY,
        }
    }
}

impl MqttSettings {
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Credentials, only when both parts are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() => Some((u, p)),
            _ => None,
        }
    }

    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Topic naming convention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopicSettings {
    pub command_prefix: String,
    pub response_prefix: String,
    pub register_topic: String,
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            command_prefix: defaults::COMMAND_PREFIX.to_string(),
            response_prefix: defaults::RESPONSE_PREFIX.to_string(),
            register_topic: defaults::REGISTER_TOPIC.to_string(),
        }
    }
}

/// Command dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommandSettings {
    pub ack_timeout_ms: u64,
    pub pending_ttl_secs: u64,
    pub reaper_interval_secs: u64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            ack_timeout_ms: defaults::ACK_TIMEOUT_MS,
            pending_ttl_secs: defaults::PENDING_TTL_SECS,
            reaper_interval_secs: defaults::REAPER_INTERVAL_SECS,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: String,
    pub path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: defaults::STORAGE_BACKEND.to_string(),
            path: defaults::STORAGE_PATH.to_string(),
        }
    }
}

impl GatewayConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Load the effective configuration.
    ///
    /// An explicit path must exist. Without one, `FIELDLINK_CONFIG` is
    /// consulted, then `config.toml` in the working directory; if neither
    /// exists the defaults are used. Environment overrides apply last.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match Self::resolve_path(explicit) {
            Some(path) => {
                info!(category = "config", path = %path.display(), "Loading config file");
                Self::from_file(&path)?
            }
            None => {
                info!(category = "config", "No config file found, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(env_vars::CONFIG) {
            return Some(PathBuf::from(path));
        }
        let local = PathBuf::from(defaults::CONFIG_FILE);
        local.exists().then_some(local)
    }

    /// Apply environment overrides using the given lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(env_vars::MQTT_HOST) {
            debug!(category = "config", host = %host, "MQTT host overridden from environment");
            self.mqtt.host = host;
        }
        if let Some(port) = lookup(env_vars::MQTT_PORT) {
            self.mqtt.port = port
                .parse()
                .map_err(|_| Error::Config(format!("{} is not a port: {}", env_vars::MQTT_PORT, port)))?;
        }
        if let Some(username) = lookup(env_vars::MQTT_USERNAME) {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = lookup(env_vars::MQTT_PASSWORD) {
            self.mqtt.password = Some(password);
        }
        if let Some(path) = lookup(env_vars::STORAGE_PATH) {
            self.storage.path = path;
        }
        Ok(())
    }

    /// Reject configurations the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.trim().is_empty() {
            return Err(Error::Config("mqtt.host must not be empty".to_string()));
        }
        if self.mqtt.port == 0 {
            return Err(Error::Config("mqtt.port must not be 0".to_string()));
        }
        if self.mqtt.keep_alive_secs == 0 {
            return Err(Error::Config("mqtt.keep_alive_secs must be positive".to_string()));
        }
        if !STORAGE_BACKENDS.contains(&self.storage.backend.as_str()) {
            return Err(Error::Config(format!(
                "Unknown storage backend: {}. Available backends: {}",
                self.storage.backend,
                STORAGE_BACKENDS.join(", ")
            )));
        }
        Ok(())
    }

    /// Copy with the broker password replaced, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.mqtt.password.is_some() {
            copy.mqtt.password = Some("********".to_string());
        }
        copy
    }
}
