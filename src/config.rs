//! Device configuration
//!
//! Settings come from an optional TOML file and are then overridden by
//! command-line values. Required identifiers may come from either source;
//! [`DeviceConfig::validate`] runs once both have been merged.

use crate::auth::{SigningAlgorithm, TokenIssuer};
use crate::error::DeviceResult;
use crate::protocol::identity::{parse_identity, DeviceIdentity};
use crate::protocol::messages::{MessageKind, DEFAULT_STATE_PAYLOAD};
use crate::transport::{TlsSettings, TlsVersion};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main device configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// Which devices to run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    #[serde(default)]
    pub project_id: String,
    #[serde(default = "default_cloud_region")]
    pub cloud_region: String,
    #[serde(default)]
    pub registry_id: String,
    /// One session is run per device id
    #[serde(default, alias = "device_id", deserialize_with = "one_or_many")]
    pub device_ids: Vec<String>,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            cloud_region: default_cloud_region(),
            registry_id: String::new(),
            device_ids: Vec::new(),
        }
    }
}

fn default_cloud_region() -> String {
    "us-central1".to_string()
}

/// Token signing settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuthSection {
    /// PEM private key used to sign tokens
    #[serde(default)]
    pub private_key_file: PathBuf,
    #[serde(default)]
    pub algorithm: SigningAlgorithm,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Root CA bundle used to verify the broker; empty for a plaintext connection
    #[serde(default = "default_ca_certs")]
    pub ca_certs: PathBuf,
    #[serde(default)]
    pub tls_version: TlsVersion,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: default_port(),
            ca_certs: default_ca_certs(),
            tls_version: TlsVersion::default(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

fn default_hostname() -> String {
    "mqtt.googleapis.com".to_string()
}

fn default_port() -> u16 {
    8883
}

fn default_ca_certs() -> PathBuf {
    PathBuf::from("roots.pem")
}

fn default_keep_alive() -> u64 {
    60
}

/// What a session sends
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_num_messages")]
    pub num_messages: u32,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default = "default_publish_delay_min")]
    pub publish_delay_min_secs: u64,
    #[serde(default = "default_publish_delay_max")]
    pub publish_delay_max_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub publish_final_state: bool,
    #[serde(default = "default_state_payload")]
    pub state_payload: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            num_messages: default_num_messages(),
            message_type: MessageKind::default(),
            publish_delay_min_secs: default_publish_delay_min(),
            publish_delay_max_secs: default_publish_delay_max(),
            connect_timeout_secs: default_connect_timeout(),
            publish_final_state: default_true(),
            state_payload: default_state_payload(),
        }
    }
}

fn default_num_messages() -> u32 {
    20
}

fn default_publish_delay_min() -> u64 {
    1
}

fn default_publish_delay_max() -> u64 {
    4
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_state_payload() -> String {
    DEFAULT_STATE_PAYLOAD.to_string()
}

/// Accept `device_id = "d1"` as well as `device_ids = ["d1", "d2"]`
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(id) => vec![id],
        OneOrMany::Many(ids) => ids,
    })
}

/// Values supplied on the command line; `None` keeps the file value
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Full client id; supplies project, region, registry and device at once
    pub client_id: Option<String>,
    pub project_id: Option<String>,
    pub cloud_region: Option<String>,
    pub registry_id: Option<String>,
    pub device_ids: Vec<String>,
    pub private_key_file: Option<PathBuf>,
    pub algorithm: Option<SigningAlgorithm>,
    pub ca_certs: Option<PathBuf>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub num_messages: Option<u32>,
    pub message_type: Option<MessageKind>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Missing required setting: {0}")]
    MissingField(&'static str),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DeviceConfig {
    /// Load the optional file, apply overrides and validate the result
    ///
    /// A `client_id` override is applied before the individual identifier
    /// overrides, which therefore win over it.
    pub fn resolve(path: Option<&Path>, mut overrides: ConfigOverrides) -> DeviceResult<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };

        if let Some(client_id) = overrides.client_id.take() {
            let identity = parse_identity(&client_id)?;
            config.device.project_id = identity.project_id().to_string();
            config.device.cloud_region = identity.cloud_region().to_string();
            config.device.registry_id = identity.registry_id().to_string();
            config.device.device_ids = vec![identity.device_id().to_string()];
        }

        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    ///
    /// The result is not validated; required fields may still be supplied
    /// through [`apply_overrides`](Self::apply_overrides).
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: DeviceConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Overlay command-line values on top of the file values
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        fn set<T>(target: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *target = value;
            }
        }

        set(&mut self.device.project_id, overrides.project_id);
        set(&mut self.device.cloud_region, overrides.cloud_region);
        set(&mut self.device.registry_id, overrides.registry_id);
        if !overrides.device_ids.is_empty() {
            self.device.device_ids = overrides.device_ids;
        }
        set(&mut self.auth.private_key_file, overrides.private_key_file);
        set(&mut self.auth.algorithm, overrides.algorithm);
        set(&mut self.mqtt.ca_certs, overrides.ca_certs);
        set(&mut self.mqtt.hostname, overrides.hostname);
        set(&mut self.mqtt.port, overrides.port);
        set(&mut self.session.num_messages, overrides.num_messages);
        set(&mut self.session.message_type, overrides.message_type);
    }

    /// Check that the merged configuration can drive a run
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier("device.project_id", &self.device.project_id)?;
        validate_identifier("device.cloud_region", &self.device.cloud_region)?;
        validate_identifier("device.registry_id", &self.device.registry_id)?;

        if self.device.device_ids.is_empty() {
            return Err(ConfigError::MissingField("device.device_ids"));
        }
        for device_id in &self.device.device_ids {
            validate_identifier("device.device_ids", device_id)?;
        }

        if self.auth.private_key_file.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("auth.private_key_file"));
        }
        if self.mqtt.hostname.is_empty() {
            return Err(ConfigError::MissingField("mqtt.hostname"));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.port must be greater than 0".to_string(),
            ));
        }
        if self.session.publish_delay_min_secs > self.session.publish_delay_max_secs {
            return Err(ConfigError::InvalidConfig(format!(
                "session.publish_delay_min_secs ({}) exceeds publish_delay_max_secs ({})",
                self.session.publish_delay_min_secs, self.session.publish_delay_max_secs
            )));
        }
        if self.session.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.connect_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// One identity per configured device id
    pub fn identities(&self) -> Vec<DeviceIdentity> {
        self.device
            .device_ids
            .iter()
            .map(|device_id| {
                DeviceIdentity::new(
                    &self.device.project_id,
                    &self.device.cloud_region,
                    &self.device.registry_id,
                    device_id,
                )
            })
            .collect()
    }

    pub fn token_issuer(&self) -> TokenIssuer {
        TokenIssuer::new(&self.auth.private_key_file, self.auth.algorithm)
    }

    /// Secure transport settings, or `None` when no CA bundle is configured
    pub fn tls_settings(&self) -> Option<TlsSettings> {
        if self.mqtt.ca_certs.as_os_str().is_empty() {
            return None;
        }
        Some(TlsSettings {
            ca_certs: self.mqtt.ca_certs.clone(),
            tls_version: self.mqtt.tls_version,
        })
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.mqtt.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.session.connect_timeout_secs)
    }
}

fn validate_identifier(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::MissingField(field));
    }
    if value.contains('/') {
        return Err(ConfigError::InvalidConfig(format!(
            "{field} '{value}' must not contain '/'"
        )));
    }
    Ok(())
}
