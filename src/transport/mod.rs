//! Transport boundary for the MQTT link
//!
//! The connection manager never talks to a socket directly. It drives two
//! providers through the traits below: a [`TunnelProvider`] that builds SSH
//! port forwards and a [`BrokerConnector`] that builds MQTT clients. The
//! production implementations live in [`ssh`] and [`mqtt`]; the mocks in
//! [`crate::testing`] implement the same traits.

use crate::error::{BrokerError, TunnelError};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use std::sync::Arc;
use std::time::Duration;

pub mod mqtt;
pub mod ssh;

/// Loopback address tunnels listen on and broker clients dial through
pub const TUNNEL_LOCAL_ADDRESS: &str = "127.0.0.1";

/// Reason code of a clean, client-requested disconnect
pub const REASON_NORMAL_DISCONNECT: u8 = 0x00;
/// Reason code used when the session dropped without a clean disconnect
pub const REASON_UNSPECIFIED_ERROR: u8 = 0x80;

/// Where a tunnel should lead
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub username: String,
    pub password: String,
    /// Address the SSH server connects to on the far side
    pub remote_bind_address: String,
    pub remote_bind_port: u16,
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for TunnelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelTarget")
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .field("username", &self.username)
            .field("remote_bind_address", &self.remote_bind_address)
            .field("remote_bind_port", &self.remote_bind_port)
            .finish()
    }
}

/// A single port forward
///
/// Methods take `&self` so liveness can be queried from caller threads
/// while the manager owns the tunnel.
#[async_trait::async_trait]
pub trait Tunnel: Send + Sync {
    /// Establish the forward; fails synchronously when it cannot
    async fn start(&self) -> Result<(), TunnelError>;

    /// Stop accepting and forwarding connections
    async fn stop(&self) -> Result<(), TunnelError>;

    /// Release the underlying SSH session
    async fn close(&self) -> Result<(), TunnelError>;

    fn is_active(&self) -> bool;

    /// Local port forwarding to the remote bind address, while active
    fn local_bind_port(&self) -> Option<u16>;
}

/// Factory for tunnels, one per attempt
pub trait TunnelProvider: Send + Sync {
    fn create(&self, target: &TunnelTarget) -> Arc<dyn Tunnel>;
}

/// A message delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Protocol-level events surfaced by [`BrokerClient::pump`]
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The broker acknowledged the connection
    Connected,
    /// The session ended; non-zero codes are unexpected
    Disconnected { reason_code: u8 },
    /// A publish arrived on a subscribed topic
    Message(Message),
}

/// Handle for issuing subscribe requests from any task
pub trait Subscriber: Send + Sync {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError>;
}

/// One MQTT client object; a fresh one is created per connection attempt
#[async_trait::async_trait]
pub trait BrokerClient: Send {
    /// Identifier used with the broker, unique per client object
    fn client_id(&self) -> &str;

    fn set_credentials(&mut self, username: &str, password: &str);

    /// Open the network connection and send CONNECT
    ///
    /// The acknowledgement is reported as [`SessionEvent::Connected`] by the
    /// next [`pump`](BrokerClient::pump).
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), BrokerError>;

    /// Request a clean disconnect
    async fn disconnect(&mut self) -> Result<(), BrokerError>;

    /// Service network I/O for up to `timeout` and return what happened
    ///
    /// Transport errors are reported as a `Disconnected` event with a
    /// non-zero reason code, never as an error.
    async fn pump(&mut self, timeout: Duration) -> Vec<SessionEvent>;

    /// Subscribe handle, available once `connect` succeeded
    fn subscriber(&self) -> Option<Arc<dyn Subscriber>>;
}

/// Factory for broker clients
pub trait BrokerConnector: Send + Sync {
    fn create(&self) -> Box<dyn BrokerClient>;
}
