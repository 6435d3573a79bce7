//! Test doubles for the transport traits
//!
//! Lets the connection manager be exercised without an SSH server or an
//! MQTT broker.

pub mod log_capture;
pub mod mocks;

pub use log_capture::LogCapture;
pub use mocks::*;
