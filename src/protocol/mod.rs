//! Device identity, topic layout and payload formats
//!
//! Everything in this module is pure: no I/O, no shared state.

pub mod identity;
pub mod messages;
pub mod topics;

pub use identity::*;
pub use messages::*;
pub use topics::*;
