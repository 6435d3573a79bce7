//! Caller-facing handle for a managed MQTT link

use crate::config::LinkSettings;
use crate::link::dispatch::{MessageHandler, SharedLink};
use crate::link::manager::ConnectionManager;
use crate::link::state::ConnectionState;
use crate::link::subscriptions::{Subscription, SubscriptionRegistry};
use crate::link::tunnel::{TunnelHandle, TunnelProbe};
use crate::transport::mqtt::RumqttConnector;
use crate::transport::ssh::SshTunnelProvider;
use crate::transport::{BrokerConnector, TunnelProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Thread-safe handle to a link kept alive by a background
/// [`ConnectionManager`]
///
/// Dropping the handle requests a stop; [`MqttLink::shutdown`] additionally
/// waits for the manager to finish.
pub struct MqttLink {
    shared: Arc<SharedLink>,
    state_rx: watch::Receiver<ConnectionState>,
    stop_tx: watch::Sender<bool>,
    tunnel: TunnelProbe,
    uses_tunnel: bool,
    stop_timeout: Duration,
    worker: Option<JoinHandle<()>>,
}

impl MqttLink {
    /// Start a link over SSH (when tunnel credentials are set) and rumqttc
    pub fn start(settings: LinkSettings, handler: Option<MessageHandler>) -> Self {
        let connector = RumqttConnector::new(
            settings.client_id_prefix.clone(),
            settings.timing.keep_alive,
            settings.timing.broker_connect_timeout,
        );
        Self::start_with(
            settings,
            handler,
            Arc::new(SshTunnelProvider),
            Arc::new(connector),
        )
    }

    /// Start a link on the current runtime with explicit providers
    pub fn start_with(
        settings: LinkSettings,
        handler: Option<MessageHandler>,
        tunnels: Arc<dyn TunnelProvider>,
        connector: Arc<dyn BrokerConnector>,
    ) -> Self {
        let (mut link, manager) = Self::detached(settings, handler, tunnels, connector);
        link.worker = Some(tokio::spawn(manager.run()));
        link
    }

    /// Build a link and its manager without spawning anything
    ///
    /// The caller drives the manager, either with `tick` or by spawning
    /// `run`.
    pub fn detached(
        settings: LinkSettings,
        handler: Option<MessageHandler>,
        tunnels: Arc<dyn TunnelProvider>,
        connector: Arc<dyn BrokerConnector>,
    ) -> (Self, ConnectionManager) {
        let registry = SubscriptionRegistry::with_entries(settings.initial_subscriptions.clone());
        let shared = Arc::new(SharedLink::new(registry, handler));
        let tunnel = TunnelHandle::new();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Initial);
        let (stop_tx, stop_rx) = watch::channel(false);

        let link = Self {
            shared: shared.clone(),
            state_rx,
            stop_tx,
            tunnel: tunnel.probe(),
            uses_tunnel: settings.uses_tunnel(),
            stop_timeout: settings.timing.stop_timeout,
            worker: None,
        };

        if settings.log_enabled {
            info!(target: "mqtt_link", host = %settings.host, tunnel = link.uses_tunnel, "MQTT link created");
        } else {
            debug!(target: "mqtt_link", host = %settings.host, tunnel = link.uses_tunnel, "MQTT link created");
        }
        let manager = ConnectionManager::new(
            settings, shared, tunnel, state_tx, stop_rx, tunnels, connector,
        );
        (link, manager)
    }

    /// True only while the manager is `Connected` and the broker session is open
    pub fn connected(&self) -> bool {
        self.shared.session_open() && self.state() == ConnectionState::Connected
    }

    /// True when tunnelling is configured and the current tunnel is live
    pub fn tunnel_active(&self) -> bool {
        self.uses_tunnel && self.tunnel.is_active()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Receiver notified on every state change
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Register a subscription and resubmit the registry to a live session
    ///
    /// Malformed input (non-UTF-8 or empty topic, qos outside 0..=2) is
    /// ignored. Duplicates change nothing.
    pub async fn add_subscription(&self, topic: impl AsRef<[u8]>, qos: i64) {
        let Some(subscription) = Subscription::parse(topic.as_ref(), qos) else {
            debug!(target: "mqtt_link", qos, "Ignoring malformed subscription");
            return;
        };
        let topic = subscription.topic.clone();
        if self.shared.dispatch.lock().await.add(subscription) {
            debug!(target: "mqtt_link", %topic, "Subscription added");
        }
    }

    /// Snapshot of the registered subscriptions
    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.dispatch.lock().await.subscriptions.all().to_vec()
    }

    /// Run `f` while holding the lock that serializes message handling
    pub async fn with_dispatch_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.shared.dispatch.lock().await;
        f()
    }

    /// Ask the manager to stop; returns immediately
    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Request a stop and wait up to the configured timeout for the manager
    pub async fn shutdown(mut self) {
        self.request_stop();
        let Some(worker) = self.worker.take() else {
            return;
        };

        match tokio::time::timeout(self.stop_timeout, worker).await {
            Ok(Ok(())) => debug!(target: "mqtt_link", "Connection manager joined"),
            Ok(Err(e)) => warn!(target: "mqtt_link", "Connection manager task failed: {}", e),
            Err(_) => warn!(
                target: "mqtt_link",
                "Connection manager did not stop within {:?}", self.stop_timeout
            ),
        }
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.request_stop();
    }
}
