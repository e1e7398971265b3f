//! # Configuration
//!
//! All broker settings live in one TOML file, by default
//! `<config_dir>/iotpub/config.toml`. Every section falls back to defaults, so
//! a missing default file still yields a usable configuration. A path given
//! explicitly on the command line must exist.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::Level;

const CONFIG_DIR: &str = "iotpub";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Username/password pair passed through to the broker unchanged.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

fn credentials(
    username: &Option<String>,
    password: &Option<String>,
    field: &'static str,
) -> Result<Option<Credentials>, ConfigError> {
    match (username, password) {
        (Some(username), Some(password)) => Ok(Some(Credentials {
            username: username.clone(),
            password: password.clone(),
        })),
        (None, None) => Ok(None),
        _ => Err(invalid(field, "username and password must be set together")),
    }
}

/// Topic table used by the MQTT publisher
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MqttProfile {
    /// Alternate device telemetry and attributes
    #[default]
    Device,
    /// Cycle through device, gateway and raw topics
    Gateway,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<Level, ConfigError> {
        self.level
            .parse()
            .map_err(|_| invalid("logging.level", format!("unknown level '{}'", self.level)))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Random `iotpub-mqtt-<suffix>` when absent
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub qos: u8,
    pub interval_ms: u64,
    pub profile: MqttProfile,
    pub gateway_devices: Vec<String>,
    pub raw_payload: String,
    /// How long `mqtt-check` holds the connection open
    pub linger_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            qos: 0,
            interval_ms: 2000,
            profile: MqttProfile::Device,
            gateway_devices: vec!["Device A".to_string(), "Device B".to_string()],
            raw_payload: "raw-telemetry".to_string(),
            linger_secs: 5,
        }
    }
}

impl MqttConfig {
    pub fn credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        credentials(&self.username, &self.password, "mqtt.username")
    }

    pub fn client_id(&self) -> String {
        self.client_id.clone().unwrap_or_else(|| {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("iotpub-mqtt-{}", &suffix[..8])
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(invalid("mqtt.host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid("mqtt.port", "must not be 0"));
        }
        if self.qos > 2 {
            return Err(invalid("mqtt.qos", format!("{} is not 0, 1 or 2", self.qos)));
        }
        if self.keep_alive_secs != 0 && self.keep_alive_secs < 5 {
            return Err(invalid("mqtt.keep_alive_secs", "must be 0 or at least 5"));
        }
        if self.gateway_devices.is_empty() {
            return Err(invalid("mqtt.gateway_devices", "needs at least one device"));
        }
        self.credentials()?;
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct StompConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub destination: String,
    /// Subscribe to `destination` and print what comes back
    pub subscribe: bool,
    pub interval_ms: u64,
    pub connect_timeout_secs: u64,
}

impl Default for StompConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 61613,
            username: None,
            password: None,
            destination: "/queue/test".to_string(),
            subscribe: true,
            interval_ms: 3000,
            connect_timeout_secs: 10,
        }
    }
}

impl StompConfig {
    pub fn credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        credentials(&self.username, &self.password, "stomp.username")
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(invalid("stomp.host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid("stomp.port", "must not be 0"));
        }
        if self.destination.is_empty() {
            return Err(invalid("stomp.destination", "must not be empty"));
        }
        self.credentials()?;
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct CoapConfig {
    pub interval_ms: u64,
    /// Upper bound on waiting for a response
    pub timeout_ms: u64,
}

impl Default for CoapConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3000,
            timeout_ms: 5000,
        }
    }
}

impl CoapConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(invalid("coap.timeout_ms", "must not be 0"));
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub mqtt: MqttConfig,
    pub stomp: StompConfig,
    pub coap: CoapConfig,
}

/// Where a loaded configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Defaults,
}

impl AppConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.logging.level()?;
        self.mqtt.validate()?;
        self.stomp.validate()?;
        self.coap.validate()?;
        Ok(())
    }

    /// Loads `explicit` if given, otherwise the default file if it exists,
    /// otherwise built-in defaults.
    pub async fn load(explicit: Option<&Path>) -> Result<(Self, ConfigSource), ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) if tokio::fs::try_exists(&path).await.unwrap_or(false) => path,
                _ => return Ok((Self::default(), ConfigSource::Defaults)),
            },
        };

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;

        let config = Self::from_toml_str(&content)?;
        Ok((config, ConfigSource::File(path)))
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
}
