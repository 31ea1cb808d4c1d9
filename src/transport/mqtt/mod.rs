//! rumqttc-backed broker client
//!
//! The module is split into three focused sub-modules:
//!
//! - [`connection`] - Pure option and TLS configuration
//! - [`message_handler`] - Pure event routing to the device's sinks
//! - [`client`] - Impure I/O operations and the event loop task
//!
//! # Usage
//!
//! ```rust,no_run
//! use iotcore_device::transport::mqtt::RumqttcBroker;
//! use iotcore_device::transport::BrokerClient;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = RumqttcBroker::new(
//!     "projects/p1/locations/us-central1/registries/r1/devices/d1",
//!     tracing::Span::none(),
//! );
//! broker.authenticate("unused", "<signed token>").await;
//! broker.connect("mqtt.googleapis.com", 8883).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::RumqttcBroker;
pub use connection::{ConnectionParams, TransportError};
pub use message_handler::{EventRoute, MessageHandler};
