//! Testing utilities and mock implementations
//!
//! This module provides a scripted broker client for exercising the device
//! lifecycle without a network connection.

pub mod mocks;

pub use mocks::*;
