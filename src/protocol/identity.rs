//! Device identity and client identifier handling
//!
//! A device is addressed by the tuple `{project, region, registry, device}`.
//! The broker expects the tuple rendered as a canonical client identifier:
//! `projects/{project}/locations/{region}/registries/{registry}/devices/{device}`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Immutable identity of one logical device
///
/// # Examples
/// ```
/// use iotcore_device::protocol::DeviceIdentity;
///
/// let identity = DeviceIdentity::new("p1", "us-central1", "r1", "d1");
/// assert_eq!(
///     identity.client_id(),
///     "projects/p1/locations/us-central1/registries/r1/devices/d1"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    project_id: String,
    cloud_region: String,
    registry_id: String,
    device_id: String,
}

impl DeviceIdentity {
    pub fn new(
        project_id: impl Into<String>,
        cloud_region: impl Into<String>,
        registry_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            cloud_region: cloud_region.into(),
            registry_id: registry_id.into(),
            device_id: device_id.into(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn cloud_region(&self) -> &str {
        &self.cloud_region
    }

    pub fn registry_id(&self) -> &str {
        &self.registry_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Canonical client identifier used for the MQTT CONNECT packet
    pub fn client_id(&self) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            self.project_id, self.cloud_region, self.registry_id, self.device_id
        )
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.client_id())
    }
}

/// Client identifier parsing errors
#[derive(Debug, Error, PartialEq)]
pub enum IdentityError {
    #[error("Malformed client id '{client_id}': {reason}")]
    MalformedClientId { client_id: String, reason: String },
}

const CLIENT_ID_KEYS: [&str; 4] = ["projects", "locations", "registries", "devices"];

/// Parse a canonical client identifier back into a [`DeviceIdentity`]
///
/// The input must contain exactly the four `key/value` pairs in canonical
/// order, with non-empty values.
pub fn parse_identity(client_id: &str) -> Result<DeviceIdentity, IdentityError> {
    let malformed = |reason: &str| IdentityError::MalformedClientId {
        client_id: client_id.to_string(),
        reason: reason.to_string(),
    };

    let segments: Vec<&str> = client_id.split('/').collect();
    if segments.len() != CLIENT_ID_KEYS.len() * 2 {
        return Err(malformed("expected 8 path segments"));
    }

    let mut values = Vec::with_capacity(CLIENT_ID_KEYS.len());
    for (pair, expected_key) in segments.chunks(2).zip(CLIENT_ID_KEYS) {
        if pair[0] != expected_key {
            return Err(malformed(&format!(
                "expected '{expected_key}' segment, found '{}'",
                pair[0]
            )));
        }
        if pair[1].is_empty() {
            return Err(malformed(&format!("empty value for '{expected_key}'")));
        }
        values.push(pair[1]);
    }

    Ok(DeviceIdentity::new(values[0], values[1], values[2], values[3]))
}
