//! Connection lifecycle for a tunnelled MQTT link
//!
//! # Architecture
//!
//! - [`state`] - the five lifecycle states
//! - [`subscriptions`] - ordered, deduplicated subscription registry
//! - [`dispatch`] - state shared between the worker, broker events and callers
//! - [`tunnel`] - ownership of at most one live tunnel
//! - [`session`] - ownership of at most one broker client and event wiring
//! - [`manager`] - the background state machine
//! - [`facade`] - the thread-safe surface handed to application code
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqttlink::config::LinkSettings;
//! use mqttlink::link::MqttLink;
//! use mqttlink::Message;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let settings = LinkSettings::new("broker.local").with_broker_credentials("labor", "labor");
//! let handler: mqttlink::link::MessageHandler = Arc::new(|message: &Message| {
//!     println!("{} -> {:?}", message.topic, message.payload);
//! });
//!
//! let link = MqttLink::start(settings, Some(handler));
//! link.add_subscription("sensors/#", 1).await;
//! // ...
//! link.shutdown().await;
//! # });
//! ```

pub mod dispatch;
pub mod facade;
pub mod manager;
pub mod session;
pub mod state;
pub mod subscriptions;
pub mod tunnel;

pub use dispatch::MessageHandler;
pub use facade::MqttLink;
pub use manager::ConnectionManager;
pub use session::BrokerSession;
pub use state::ConnectionState;
pub use subscriptions::{Subscription, SubscriptionRegistry};
pub use tunnel::{TunnelHandle, TunnelProbe};
