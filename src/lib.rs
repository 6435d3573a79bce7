//! mqttlink - a self-healing MQTT connection with optional SSH tunnelling
//!
//! # Overview
//!
//! A background [`ConnectionManager`](link::ConnectionManager) keeps one MQTT
//! session alive, optionally through an SSH port forward, and rebuilds it
//! from scratch whenever the broker or the tunnel goes away. Application code
//! holds an [`MqttLink`](link::MqttLink) and can, from any task:
//! - query whether the link is connected and the tunnel is live
//! - register subscriptions, which survive every reconnect
//! - receive messages through a handler serialized with its own calls
//! - stop the link
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqttlink::config::LinkConfig;
//! use mqttlink::link::MqttLink;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LinkConfig::load_from_file(Path::new("mqttlink.toml"))?;
//! let link = MqttLink::start(config.resolve(), None);
//!
//! link.add_subscription("sensors/+/temperature", 1).await;
//! if link.connected() {
//!     println!("link is up");
//! }
//! link.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod link;
pub mod observability;
pub mod testing;
pub mod transport;

pub use config::{Credentials, LinkConfig, LinkSettings, Timing};
pub use error::{BrokerError, LinkError, LinkResult, TunnelError};
pub use link::{ConnectionState, MessageHandler, MqttLink, Subscription};
pub use transport::Message;
