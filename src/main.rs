//! Emulated IoT Core device - Main Entry Point
//!
//! Runs one session per `--device-id` and exits non-zero if any of them
//! failed.

use clap::Parser;
use iotcore_device::auth::SigningAlgorithm;
use iotcore_device::config::{ConfigOverrides, DeviceConfig};
use iotcore_device::device::run_fleet;
use iotcore_device::error::DeviceResult;
use iotcore_device::fleet_span;
use iotcore_device::observability::init_default_logging;
use iotcore_device::protocol::MessageKind;
use std::path::PathBuf;
use std::process;
use tracing::{error, info, Instrument};

/// Example device connecting to a cloud MQTT bridge
#[derive(Parser)]
#[command(name = "iotcore-device")]
#[command(about = "Emulated IoT device publishing telemetry over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Full client id (projects/P/locations/L/registries/R/devices/D)
    #[arg(long, value_name = "CLIENT_ID")]
    client_id: Option<String>,

    /// Cloud project
    #[arg(long, env = "GOOGLE_CLOUD_PROJECT")]
    project_id: Option<String>,

    /// Device registry
    #[arg(long)]
    registry_id: Option<String>,

    /// Device id; repeat to run a fleet
    #[arg(long = "device-id", value_name = "ID")]
    device_ids: Vec<String>,

    /// Cloud region [default: us-central1]
    #[arg(long)]
    cloud_region: Option<String>,

    /// Private key used to sign tokens
    #[arg(long, value_name = "FILE")]
    private_key_file: Option<PathBuf>,

    /// Token signing algorithm (RS256 or ES256) [default: RS256]
    #[arg(long, value_parser = parse_algorithm)]
    algorithm: Option<SigningAlgorithm>,

    /// Root CA bundle [default: roots.pem]
    #[arg(long, value_name = "FILE")]
    ca_certs: Option<PathBuf>,

    /// MQTT bridge hostname [default: mqtt.googleapis.com]
    #[arg(long)]
    mqtt_bridge_hostname: Option<String>,

    /// MQTT bridge port [default: 8883]
    #[arg(long)]
    mqtt_bridge_port: Option<u16>,

    /// Number of messages to publish [default: 20]
    #[arg(long)]
    num_messages: Option<u32>,

    /// Publish to the events or state topic [default: event]
    #[arg(long, value_parser = parse_message_type)]
    message_type: Option<MessageKind>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            client_id: self.client_id.clone(),
            project_id: self.project_id.clone(),
            cloud_region: self.cloud_region.clone(),
            registry_id: self.registry_id.clone(),
            device_ids: self.device_ids.clone(),
            private_key_file: self.private_key_file.clone(),
            algorithm: self.algorithm,
            ca_certs: self.ca_certs.clone(),
            hostname: self.mqtt_bridge_hostname.clone(),
            port: self.mqtt_bridge_port,
            num_messages: self.num_messages,
            message_type: self.message_type,
        }
    }
}

fn parse_algorithm(value: &str) -> Result<SigningAlgorithm, String> {
    value.parse().map_err(|e| format!("{e}"))
}

fn parse_message_type(value: &str) -> Result<MessageKind, String> {
    value.parse()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging(cli.verbose);

    info!("Starting iotcore-device v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let span = fleet_span!(devices = config.device.device_ids.len());
    let results = run_fleet(&config).instrument(span).await;

    let mut failed = 0;
    for (device_id, result) in &results {
        match result {
            Ok(report) => info!("{}", report),
            Err(e) => {
                failed += 1;
                error!(device_id = %device_id, "Device run failed: {}", e);
            }
        }
    }

    if failed > 0 || results.is_empty() {
        error!("{} of {} device runs failed", failed, results.len());
        process::exit(1);
    }

    info!("Finished.");
}

fn load_configuration(cli: &Cli) -> DeviceResult<DeviceConfig> {
    if let Some(path) = &cli.config {
        info!("Loading configuration from: {}", path.display());
    }
    DeviceConfig::resolve(cli.config.as_deref(), cli.overrides())
}
