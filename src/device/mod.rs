//! Device connection lifecycle
//!
//! - [`backoff`] - Pure reconnection backoff decisions
//! - [`connection`] - Connectivity state shared with broker callbacks
//! - [`events`] - The event sink registered with the broker client
//! - [`inbound`] - Configuration and command handling
//! - [`lifecycle`] - The session driver and fleet runner

pub mod backoff;
pub mod connection;
pub mod events;
pub mod inbound;
pub mod lifecycle;

pub use backoff::{BackoffCounter, ReconnectionDecision, MAX_BACKOFF_SECS};
pub use connection::{AttemptOutcome, ConnectionSnapshot, ConnectionState, ConnectionStateMachine};
pub use events::{DeviceEventSink, SessionStats};
pub use inbound::{InboundHandler, InboundOutcome};
pub use lifecycle::{run_fleet, run_fleet_with, FleetResult, SessionDriver, SessionReport, SessionSettings};
