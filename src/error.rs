//! Error types for the device connection lifecycle
//!
//! Fatal conditions abort the current run (after teardown); the two
//! inbound-side conditions are logged and the device carries on.

use crate::device::connection::ConnectionState;
use crate::protocol::identity::IdentityError;
use crate::transport::mqtt::TransportError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for device operations
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Credential file '{}' unavailable: {source}", path.display())]
    CredentialUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Token signing failed: {message}")]
    SigningFailure { message: String },

    #[error("Exceeded maximum backoff time for device '{device_id}' (next backoff {min_backoff_secs}s). Giving up")]
    BackoffExhausted {
        device_id: String,
        min_backoff_secs: u64,
    },

    #[error("No connection confirmation received within {timeout:?}")]
    ConnectTimeout { timeout: Duration },

    #[error("Broker rejected subscription (message id {message_id})")]
    SubscriptionRejected { message_id: u16 },

    #[error("Malformed payload on topic '{topic}': {message}")]
    MalformedInboundPayload { topic: String, message: String },

    #[error("Connect rejected: connection is already {state:?}")]
    ConnectRejected { state: ConnectionState },

    #[error(transparent)]
    MalformedClientId(#[from] IdentityError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl DeviceError {
    /// Whether this error ends the current run
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            DeviceError::SubscriptionRejected { .. } | DeviceError::MalformedInboundPayload { .. }
        )
    }

    /// Create signing failure error
    pub fn signing_failure<S: Into<String>>(message: S) -> Self {
        Self::SigningFailure {
            message: message.into(),
        }
    }

    /// Create malformed inbound payload error
    pub fn malformed_payload<T: Into<String>, M: Into<String>>(topic: T, message: M) -> Self {
        Self::MalformedInboundPayload {
            topic: topic.into(),
            message: message.into(),
        }
    }
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;
