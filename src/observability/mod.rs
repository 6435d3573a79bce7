//! Structured logging for the link and its binary

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{link_span, tunnel_span};
