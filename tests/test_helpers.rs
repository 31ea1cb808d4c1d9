//! Test helpers and utilities for integration tests

use iotcore_device::auth::SigningAlgorithm;
use iotcore_device::config::DeviceConfig;
use iotcore_device::device::{SessionDriver, SessionSettings};
use iotcore_device::protocol::DeviceIdentity;
use iotcore_device::testing::MockBroker;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Span;

/// Path of a file under `tests/fixtures`
#[allow(dead_code)]
pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

#[allow(dead_code)]
pub fn test_identity() -> DeviceIdentity {
    DeviceIdentity::new("p1", "us-central1", "r1", "d1")
}

/// A valid configuration for the given devices with short, fixed publish delays
#[allow(dead_code)]
pub fn test_config(device_ids: &[&str]) -> DeviceConfig {
    let mut config = DeviceConfig::default();
    config.device.project_id = "p1".to_string();
    config.device.registry_id = "r1".to_string();
    config.device.device_ids = device_ids.iter().map(|id| id.to_string()).collect();
    config.auth.private_key_file = fixture("rsa_private.pem");
    config.auth.algorithm = SigningAlgorithm::Rs256;
    config.mqtt.hostname = "localhost".to_string();
    config.mqtt.ca_certs = fixture("roots.pem");
    config.session.num_messages = 5;
    config.session.publish_delay_min_secs = 1;
    config.session.publish_delay_max_secs = 1;
    config
}

/// A driver for device `d1` over `broker`
#[allow(dead_code)]
pub fn test_driver(config: &DeviceConfig, broker: Arc<MockBroker>) -> SessionDriver {
    SessionDriver::new(
        test_identity(),
        config.token_issuer(),
        broker,
        SessionSettings::from_config(config),
        Span::none(),
    )
}
