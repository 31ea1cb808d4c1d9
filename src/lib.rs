//! Emulated IoT Core device
//!
//! A device that authenticates to a cloud MQTT bridge with short-lived
//! signed tokens, keeps a session alive with bounded exponential backoff,
//! publishes telemetry and receives configuration and command pushes.
//!
//! # Overview
//!
//! - [`protocol`] - Device identity, topics and payload formats
//! - [`auth`] - Token issuance
//! - [`transport`] - The broker client contract and its rumqttc implementation
//! - [`device`] - Connection state machine and session driver
//! - [`config`] - TOML and command-line configuration
//!
//! # Quick Start
//!
//! ```rust
//! use iotcore_device::protocol::{telemetry_payload, DeviceIdentity, TopicSet};
//!
//! let identity = DeviceIdentity::new("p1", "us-central1", "r1", "d1");
//! let topics = TopicSet::for_identity(&identity);
//!
//! assert_eq!(topics.events, "/devices/d1/events");
//! assert_eq!(telemetry_payload(&identity, 1), "r1/d1-payload-1");
//! ```

pub mod auth;
pub mod config;
pub mod device;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use auth::{AuthToken, SigningAlgorithm, TokenIssuer};
pub use config::{ConfigError, ConfigOverrides, DeviceConfig};
pub use device::{run_fleet, ConnectionState, ConnectionStateMachine, SessionDriver, SessionReport};
pub use error::{DeviceError, DeviceResult};
pub use protocol::*;
pub use transport::mqtt::RumqttcBroker;
