//! rumqttc-backed broker client
//!
//! - [`connection`] - pure option building and client id generation
//! - [`event_router`] - pure mapping from rumqttc events to [`SessionEvent`]s
//! - [`client`] - impure I/O against the rumqttc event loop
//!
//! [`SessionEvent`]: crate::transport::SessionEvent

pub mod client;
pub mod connection;
pub mod event_router;

pub use client::{RumqttClient, RumqttConnector};
pub use connection::{configure_mqtt_options, generate_client_id};
pub use event_router::route_mqtt_event;
