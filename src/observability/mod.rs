//! Observability for device runs
//!
//! Structured logging only; every device run carries its own span.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{device_span, fleet_span};
