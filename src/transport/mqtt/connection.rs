//! Pure connection configuration for the MQTT broker client
//!
//! This module contains pure functions for building client options and the
//! TLS client configuration from the device's settings.

use crate::transport::{TlsSettings, TlsVersion};
use rumqttc::tokio_rustls::rustls::{
    version, ClientConfig, RootCertStore, SupportedProtocolVersion,
};
use rumqttc::{MqttOptions, TlsConfiguration, Transport as RumqttcTransport};
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default keep alive for device sessions
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// Configuration documents may be large; raise the packet limits accordingly
const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Broker client transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request failed")]
    RequestFailed(#[source] rumqttc::ClientError),
    #[error("Failed to read CA certificates from '{path}': {source}")]
    CaCertificates {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("TLS configuration error: {0}")]
    Tls(String),
    #[error("Not connected: {0}")]
    NotConnected(String),
}

/// Everything needed to open one broker connection
#[derive(Clone)]
pub struct ConnectionParams {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub credentials: Option<(String, String)>,
    pub tls: Option<Arc<ClientConfig>>,
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("client_id", &self.client_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("keep_alive", &self.keep_alive)
            .field("has_credentials", &self.credentials.is_some())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Pure function to configure MQTT options from connection parameters
pub fn configure_mqtt_options(params: &ConnectionParams) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(&params.client_id, &params.host, params.port);

    mqtt_options.set_keep_alive(params.keep_alive);
    mqtt_options.set_clean_session(true);
    mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    if let Some((username, password)) = &params.credentials {
        mqtt_options.set_credentials(username, password);
    }

    if let Some(tls) = &params.tls {
        let transport = RumqttcTransport::tls_with_config(TlsConfiguration::Rustls(tls.clone()));
        mqtt_options.set_transport(transport);
    }

    mqtt_options
}

/// Parse a PEM bundle into a root certificate store
pub fn load_root_certificates(pem: &[u8]) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    let mut reader = BufReader::new(pem);

    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| TransportError::Tls(format!("Invalid PEM: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| TransportError::Tls(format!("Rejected root certificate: {e}")))?;
    }

    if roots.is_empty() {
        return Err(TransportError::Tls(
            "CA bundle contains no certificates".to_string(),
        ));
    }

    Ok(roots)
}

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&version::TLS13];

fn protocol_versions(tls_version: TlsVersion) -> &'static [&'static SupportedProtocolVersion] {
    match tls_version {
        TlsVersion::Tls12 => TLS12_ONLY,
        TlsVersion::Tls13 => TLS13_ONLY,
    }
}

/// Build the TLS client configuration pinned to the requested version
pub fn build_tls_config(settings: &TlsSettings) -> Result<ClientConfig, TransportError> {
    let pem = std::fs::read(&settings.ca_certs).map_err(|source| TransportError::CaCertificates {
        path: settings.ca_certs.display().to_string(),
        source,
    })?;
    let roots = load_root_certificates(&pem)?;

    let config = ClientConfig::builder_with_protocol_versions(protocol_versions(
        settings.tls_version,
    ))
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(config)
}
