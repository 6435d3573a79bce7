//! Background state machine that keeps the link up
//!
//! ```text
//! Initial ──tunnel creds──> CreatingTunnel ──ok──> ConnectingBroker ──ok──> Connected
//!    │                          │                    │   ^  (retry)            │
//!    └──no tunnel──────────────────────────────────> │   └───── session lost ──┤
//!    ^                          v                    │                         │
//!    └──── cooldown ─────── Waiting                  │                         │
//!    ^                                               │                         │
//!    └───────────── tunnel dead ─────────────────────┴─────────────────────────┘
//! ```
//!
//! One step of the machine is [`ConnectionManager::tick`]; [`run`] ticks on
//! a fixed interval until a stop is requested and then shuts down.
//!
//! [`run`]: ConnectionManager::run

use crate::config::LinkSettings;
use crate::link::dispatch::SharedLink;
use crate::link::session::BrokerSession;
use crate::link::state::ConnectionState;
use crate::link::tunnel::TunnelHandle;
use crate::link_span;
use crate::transport::{BrokerConnector, TunnelProvider, TunnelTarget, TUNNEL_LOCAL_ADDRESS};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

pub struct ConnectionManager {
    settings: LinkSettings,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    stop_rx: watch::Receiver<bool>,
    tunnel: TunnelHandle,
    session: BrokerSession,
    tunnels: Arc<dyn TunnelProvider>,
    connector: Arc<dyn BrokerConnector>,
    /// Set when entering `Waiting`
    retry_timer: Instant,
    /// Decided in `Initial` for the attempt that follows
    use_tunnel: bool,
    /// Consecutive broker connect failures with the tunnel still up
    broker_failures: u32,
}

impl ConnectionManager {
    pub(crate) fn new(
        settings: LinkSettings,
        shared: Arc<SharedLink>,
        tunnel: TunnelHandle,
        state_tx: watch::Sender<ConnectionState>,
        stop_rx: watch::Receiver<bool>,
        tunnels: Arc<dyn TunnelProvider>,
        connector: Arc<dyn BrokerConnector>,
    ) -> Self {
        let session = BrokerSession::new(shared, settings.log_enabled);
        Self {
            settings,
            state: ConnectionState::Initial,
            state_tx,
            stop_rx,
            tunnel,
            session,
            tunnels,
            connector,
            retry_timer: Instant::now(),
            use_tunnel: false,
            broker_failures: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn tunnel(&self) -> &TunnelHandle {
        &self.tunnel
    }

    pub fn session(&self) -> &BrokerSession {
        &self.session
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Tick until a stop is requested, then shut down
    pub async fn run(mut self) {
        let span = link_span!(host = %self.settings.host, tunnel = self.settings.uses_tunnel());
        async move {
            self.lifecycle_info("Connection manager started");
            while !self.stop_requested() {
                tokio::time::sleep(self.settings.timing.poll_interval).await;
                if self.stop_requested() {
                    break;
                }
                self.tick().await;
            }
            self.shutdown().await;
        }
        .instrument(span)
        .await
    }

    /// Execute one step of the state machine
    pub async fn tick(&mut self) {
        match self.state {
            ConnectionState::Initial => self.on_initial().await,
            ConnectionState::CreatingTunnel => self.on_creating_tunnel().await,
            ConnectionState::Waiting => self.on_waiting(),
            ConnectionState::ConnectingBroker => self.on_connecting_broker().await,
            ConnectionState::Connected => self.on_connected().await,
        }
    }

    /// Disconnect the broker, give the disconnect time to flush, close the tunnel
    pub async fn shutdown(&mut self) {
        self.lifecycle_info("Stop requested, shutting down");
        self.session.teardown().await;
        tokio::time::sleep(self.settings.timing.shutdown_flush).await;
        self.tunnel.teardown().await;
        debug!(target: "mqtt_link", "Connection manager stopped");
    }

    async fn on_initial(&mut self) {
        self.tunnel.teardown().await;
        self.use_tunnel = self.settings.uses_tunnel();
        self.broker_failures = 0;
        if self.use_tunnel {
            self.transition(ConnectionState::CreatingTunnel);
        } else {
            self.transition(ConnectionState::ConnectingBroker);
        }
    }

    async fn on_creating_tunnel(&mut self) {
        let Some(target) = self.tunnel_target() else {
            self.transition(ConnectionState::Initial);
            return;
        };

        match self.tunnel.open(self.tunnels.as_ref(), &target).await {
            Ok(()) => {
                self.lifecycle_info("SSH: Creating tunnel successful!");
                self.transition(ConnectionState::ConnectingBroker);
            }
            Err(e) => {
                self.lifecycle_error(&format!("SSH: Creating tunnel failed: {e}"));
                self.retry_timer = Instant::now();
                self.transition(ConnectionState::Waiting);
            }
        }
    }

    fn on_waiting(&mut self) {
        if self.retry_timer.elapsed() >= self.settings.timing.retry_cooldown {
            self.transition(ConnectionState::Initial);
        }
    }

    async fn on_connecting_broker(&mut self) {
        let address = if self.use_tunnel {
            self.tunnel
                .local_bind_port()
                .map(|port| (TUNNEL_LOCAL_ADDRESS.to_string(), port))
        } else {
            Some((self.settings.host.clone(), self.settings.broker_port))
        };

        let result = match address {
            Some((host, port)) => {
                let credentials = self.settings.broker_credentials.clone();
                self.session
                    .open(self.connector.as_ref(), &host, port, credentials.as_ref())
                    .await
                    .map_err(|e| e.to_string())
            }
            None => Err("tunnel has no local port".to_string()),
        };

        match result {
            Ok(()) => {
                self.broker_failures = 0;
                self.session.pump(self.settings.timing.connect_pump).await;
                self.transition(ConnectionState::Connected);
                self.lifecycle_info("MQTT: Client connected successful!");
            }
            Err(message) if self.use_tunnel && !self.tunnel.is_active() => {
                self.lifecycle_error(&format!("MQTT: Client connecting failed: {message}"));
                self.transition(ConnectionState::Initial);
            }
            Err(message) => {
                self.broker_failures += 1;
                if self.broker_failures == 1 {
                    self.lifecycle_error(&format!("MQTT: Client connecting failed: {message}"));
                } else {
                    debug!(
                        target: "mqtt_link",
                        attempts = self.broker_failures,
                        "Broker still unreachable: {}", message
                    );
                }
            }
        }
    }

    async fn on_connected(&mut self) {
        self.session.pump(self.settings.timing.connected_pump).await;

        if self.use_tunnel && !self.tunnel.is_active() {
            if self.settings.log_enabled {
                warn!(target: "mqtt_link", "SSH tunnel lost, rebuilding link");
            }
            self.session.teardown().await;
            self.transition(ConnectionState::Initial);
        } else if !self.session.is_open() {
            self.session.teardown().await;
            self.transition(ConnectionState::ConnectingBroker);
        }
    }

    fn tunnel_target(&self) -> Option<TunnelTarget> {
        let credentials = self.settings.tunnel_credentials()?;
        Some(TunnelTarget {
            ssh_host: self.settings.host.clone(),
            ssh_port: self.settings.ssh_port,
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            remote_bind_address: self.settings.remote_bind_address.clone(),
            remote_bind_port: self.settings.broker_port,
            connect_timeout: self.settings.timing.tunnel_connect_timeout,
        })
    }

    fn transition(&mut self, next: ConnectionState) {
        if next == self.state {
            return;
        }
        debug!(target: "mqtt_link", from = %self.state, to = %next, "State transition");
        self.state = next;
        self.state_tx.send_replace(next);
    }

    fn lifecycle_info(&self, message: &str) {
        if self.settings.log_enabled {
            info!(target: "mqtt_link", "{}", message);
        } else {
            debug!(target: "mqtt_link", "{}", message);
        }
    }

    fn lifecycle_error(&self, message: &str) {
        if self.settings.log_enabled {
            error!(target: "mqtt_link", "{}", message);
        } else {
            debug!(target: "mqtt_link", "{}", message);
        }
    }
}
