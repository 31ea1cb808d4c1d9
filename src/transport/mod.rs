//! Broker client abstraction
//!
//! The device core drives a broker through [`BrokerClient`] and learns about
//! everything that happens on the wire through a registered
//! [`BrokerEventSink`]. Sink methods are invoked from the client's own
//! background task, never from the caller of `connect`/`publish`.

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

pub mod mqtt;

pub use mqtt::TransportError;

/// Result code delivered with a connection acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectCode {
    Accepted,
    RefusedProtocolVersion,
    BadClientId,
    ServiceUnavailable,
    BadCredentials,
    NotAuthorized,
}

impl ConnectCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ConnectCode::Accepted)
    }
}

impl fmt::Display for ConnectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectCode::Accepted => "Connection Accepted.",
            ConnectCode::RefusedProtocolVersion => "Connection Refused: unacceptable protocol version.",
            ConnectCode::BadClientId => "Connection Refused: identifier rejected.",
            ConnectCode::ServiceUnavailable => "Connection Refused: broker unavailable.",
            ConnectCode::BadCredentials => "Connection Refused: bad user name or password.",
            ConnectCode::NotAuthorized => "Connection Refused: not authorised.",
        };
        f.write_str(text)
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The device asked to disconnect
    ClientRequested,
    /// The broker sent DISCONNECT
    BrokerInitiated,
    /// Network or protocol failure
    NetworkError(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClientRequested => f.write_str("client requested disconnect"),
            DisconnectReason::BrokerInitiated => f.write_str("broker closed the session"),
            DisconnectReason::NetworkError(error) => write!(f, "network error: {error}"),
        }
    }
}

/// A message delivered on one of the device's subscriptions
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// TLS protocol version pinned for the broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum TlsVersion {
    #[default]
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

/// Secure transport settings, passed through to the client unmodified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    /// PEM bundle of trusted root certificates
    pub ca_certs: PathBuf,
    pub tls_version: TlsVersion,
}

/// Event sinks registered by the device core
///
/// Invocations are serialized relative to each other but run concurrently
/// with the code driving the client.
pub trait BrokerEventSink: Send + Sync {
    /// Connection acknowledgment (or refusal) received
    fn on_connect(&self, code: ConnectCode);

    /// Session ended
    fn on_disconnect(&self, reason: DisconnectReason);

    /// A QoS 1 publish was acknowledged by the broker
    fn on_publish_ack(&self, message_id: u16);

    /// A subscribe request was answered; `None` marks a rejected filter
    fn on_subscribe_ack(&self, message_id: u16, granted: Vec<Option<QoS>>);

    /// A message arrived on a subscribed topic
    fn on_message(&self, message: InboundMessage);
}

/// Operation set the device core uses to drive a broker connection
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Register the sink that receives all connection events
    async fn set_event_sink(&self, sink: Arc<dyn BrokerEventSink>);

    /// Credentials used by subsequent `connect` calls
    async fn authenticate(&self, username: &str, password: &str);

    /// Secure transport used by subsequent `connect` calls
    async fn configure_tls(&self, settings: TlsSettings) -> Result<(), TransportError>;

    /// Start a connection attempt; completion is reported through `on_connect`
    async fn connect(&self, host: &str, port: u16) -> Result<(), TransportError>;

    /// Request a graceful disconnect
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Queue a publish; QoS 1 publishes are acknowledged through `on_publish_ack`
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Queue a subscribe request; the outcome arrives through `on_subscribe_ack`
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Stop the background network task and release its resources
    async fn stop(&self);
}
