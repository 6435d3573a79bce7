//! Mock tunnels and broker clients
//!
//! Every mock records what the connection manager did to it and exposes
//! switches for the failures the manager must survive. State lives behind
//! `Arc`s so a test keeps a probe after the mock has been handed over.

use crate::config::Credentials;
use crate::error::{BrokerError, TunnelError};
use crate::transport::{
    BrokerClient, BrokerConnector, Message, SessionEvent, Subscriber, Tunnel, TunnelProvider,
    TunnelTarget,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Local port reported by mock tunnels unless overridden
pub const MOCK_TUNNEL_PORT: u16 = 41883;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-memory tunnel
#[derive(Debug)]
pub struct MockTunnel {
    active: AtomicBool,
    fail_start: bool,
    fail_teardown: bool,
    local_port: u16,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

impl MockTunnel {
    pub fn new(local_port: u16) -> Self {
        Self {
            active: AtomicBool::new(false),
            fail_start: false,
            fail_teardown: false,
            local_port,
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        }
    }

    /// Simulate the SSH session dying underneath the link
    pub fn kill(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tunnel for MockTunnel {
    async fn start(&self) -> Result<(), TunnelError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(TunnelError::Connect {
                host: "mock".to_string(),
                port: 22,
                message: "Mock tunnel failure".to_string(),
            });
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TunnelError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        if self.fail_teardown {
            return Err(TunnelError::Channel {
                message: "Mock stop failure".to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TunnelError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        if self.fail_teardown {
            return Err(TunnelError::Channel {
                message: "Mock close failure".to_string(),
            });
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn local_bind_port(&self) -> Option<u16> {
        self.is_active().then_some(self.local_port)
    }
}

/// Builds [`MockTunnel`]s and keeps every one it built
#[derive(Debug, Default)]
pub struct MockTunnelProvider {
    tunnels: Mutex<Vec<Arc<MockTunnel>>>,
    targets: Mutex<Vec<TunnelTarget>>,
    fail_start: AtomicBool,
    fail_teardown: AtomicBool,
}

impl MockTunnelProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider whose tunnels never start
    pub fn with_failure() -> Self {
        let provider = Self::new();
        provider.set_fail_start(true);
        provider
    }

    /// Applies to tunnels created from now on
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Applies to tunnels created from now on
    pub fn set_fail_teardown(&self, fail: bool) {
        self.fail_teardown.store(fail, Ordering::SeqCst);
    }

    pub fn local_port(&self) -> u16 {
        MOCK_TUNNEL_PORT
    }

    pub fn tunnels(&self) -> Vec<Arc<MockTunnel>> {
        lock(&self.tunnels).clone()
    }

    pub fn created(&self) -> usize {
        lock(&self.tunnels).len()
    }

    pub fn last(&self) -> Option<Arc<MockTunnel>> {
        lock(&self.tunnels).last().cloned()
    }

    pub fn last_target(&self) -> Option<TunnelTarget> {
        lock(&self.targets).last().cloned()
    }

    /// Tunnels reporting themselves active right now
    pub fn live(&self) -> usize {
        lock(&self.tunnels).iter().filter(|t| t.is_active()).count()
    }
}

impl TunnelProvider for MockTunnelProvider {
    fn create(&self, target: &TunnelTarget) -> Arc<dyn Tunnel> {
        let mut tunnel = MockTunnel::new(MOCK_TUNNEL_PORT);
        tunnel.fail_start = self.fail_start.load(Ordering::SeqCst);
        tunnel.fail_teardown = self.fail_teardown.load(Ordering::SeqCst);
        let tunnel = Arc::new(tunnel);

        lock(&self.tunnels).push(tunnel.clone());
        lock(&self.targets).push(target.clone());
        tunnel
    }
}

/// One call to [`BrokerClient::connect`]
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectAttempt {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Default)]
struct ProbeState {
    fail_connect: bool,
    fail_subscribe: bool,
    withhold_connack: bool,
    created: Vec<String>,
    attempts: Vec<ConnectAttempt>,
    disconnects: usize,
    subscriptions: Vec<(String, String, QoS)>,
    /// Events for the connected client's next pump
    queued: VecDeque<SessionEvent>,
}

/// Shared view into everything [`MockConnector`] clients did
#[derive(Debug, Default)]
pub struct BrokerProbe {
    state: Mutex<ProbeState>,
}

impl BrokerProbe {
    pub fn set_fail_connect(&self, fail: bool) {
        lock(&self.state).fail_connect = fail;
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        lock(&self.state).fail_subscribe = fail;
    }

    /// Connect succeeds but the broker never acknowledges it
    pub fn set_withhold_connack(&self, withhold: bool) {
        lock(&self.state).withhold_connack = withhold;
    }

    /// Queue an event for the next pump of the connected client
    pub fn push_event(&self, event: SessionEvent) {
        lock(&self.state).queued.push_back(event);
    }

    /// Broker-side disconnect with `reason_code`
    pub fn kick(&self, reason_code: u8) {
        self.push_event(SessionEvent::Disconnected { reason_code });
    }

    /// Broker publishes `payload` on `topic`
    pub fn deliver(&self, topic: &str, payload: Bytes) {
        self.push_event(SessionEvent::Message(Message {
            topic: topic.to_string(),
            payload,
            qos: QoS::AtMostOnce,
            retain: false,
        }));
    }

    /// Ids of every client object created, in order
    pub fn client_ids(&self) -> Vec<String> {
        lock(&self.state).created.clone()
    }

    pub fn connect_attempts(&self) -> Vec<ConnectAttempt> {
        lock(&self.state).attempts.clone()
    }

    pub fn disconnects(&self) -> usize {
        lock(&self.state).disconnects
    }

    /// Every subscribe call, across all clients
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        lock(&self.state)
            .subscriptions
            .iter()
            .map(|(_, topic, qos)| (topic.clone(), *qos))
            .collect()
    }

    /// Subscribe calls issued through one client
    pub fn subscriptions_for(&self, client_id: &str) -> Vec<(String, QoS)> {
        lock(&self.state)
            .subscriptions
            .iter()
            .filter(|(id, _, _)| id == client_id)
            .map(|(_, topic, qos)| (topic.clone(), *qos))
            .collect()
    }

    pub fn clear_subscriptions(&self) {
        lock(&self.state).subscriptions.clear();
    }
}

/// Creates [`MockBrokerClient`]s with distinct ids
#[derive(Debug, Default)]
pub struct MockConnector {
    probe: Arc<BrokerProbe>,
    counter: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector whose clients never connect
    pub fn with_failure() -> Self {
        let connector = Self::new();
        connector.probe.set_fail_connect(true);
        connector
    }

    pub fn probe(&self) -> Arc<BrokerProbe> {
        self.probe.clone()
    }
}

impl BrokerConnector for MockConnector {
    fn create(&self) -> Box<dyn BrokerClient> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let client_id = format!("mock-client-{n}");
        lock(&self.probe.state).created.push(client_id.clone());

        Box::new(MockBrokerClient {
            client_id,
            credentials: None,
            connected: false,
            pending: VecDeque::new(),
            probe: self.probe.clone(),
        })
    }
}

pub struct MockBrokerClient {
    client_id: String,
    credentials: Option<Credentials>,
    connected: bool,
    pending: VecDeque<SessionEvent>,
    probe: Arc<BrokerProbe>,
}

#[async_trait]
impl BrokerClient for MockBrokerClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn set_credentials(&mut self, username: &str, password: &str) {
        self.credentials = Some(Credentials::new(username, password));
    }

    async fn connect(&mut self, host: &str, port: u16) -> Result<(), BrokerError> {
        let mut state = lock(&self.probe.state);
        state.attempts.push(ConnectAttempt {
            client_id: self.client_id.clone(),
            host: host.to_string(),
            port,
            credentials: self.credentials.clone(),
        });
        if state.fail_connect {
            return Err(BrokerError::ConnectionFailed(
                "Mock connection refused".to_string(),
            ));
        }
        // events queued for an earlier client died with it
        state.queued.clear();
        self.connected = true;
        if !state.withhold_connack {
            self.pending.push_back(SessionEvent::Connected);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        lock(&self.probe.state).disconnects += 1;
        self.connected = false;
        Ok(())
    }

    async fn pump(&mut self, _timeout: Duration) -> Vec<SessionEvent> {
        if !self.connected {
            return Vec::new();
        }
        let mut events: Vec<SessionEvent> = self.pending.drain(..).collect();
        events.extend(lock(&self.probe.state).queued.drain(..));

        if events
            .iter()
            .any(|e| matches!(e, SessionEvent::Disconnected { .. }))
        {
            self.connected = false;
        }
        events
    }

    fn subscriber(&self) -> Option<Arc<dyn Subscriber>> {
        if !self.connected {
            return None;
        }
        Some(Arc::new(MockSubscriber {
            client_id: self.client_id.clone(),
            probe: self.probe.clone(),
        }))
    }
}

struct MockSubscriber {
    client_id: String,
    probe: Arc<BrokerProbe>,
}

impl Subscriber for MockSubscriber {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        let mut state = lock(&self.probe.state);
        if state.fail_subscribe {
            return Err(BrokerError::NotConnected);
        }
        state
            .subscriptions
            .push((self.client_id.clone(), topic.to_string(), qos));
        Ok(())
    }
}

/// Subscriber that records every call and optionally rejects it
#[derive(Debug, Default)]
pub struct RecordingSubscriber {
    calls: Mutex<Vec<(String, QoS)>>,
    should_fail: bool,
}

impl RecordingSubscriber {
    pub fn failing() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, QoS)> {
        lock(&self.calls).clone()
    }
}

impl Subscriber for RecordingSubscriber {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        lock(&self.calls).push((topic.to_string(), qos));
        if self.should_fail {
            return Err(BrokerError::NotConnected);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_tunnel_lifecycle() {
        let tunnel = MockTunnel::new(1234);
        assert_eq!(tunnel.local_bind_port(), None);

        tunnel.start().await.unwrap();
        assert!(tunnel.is_active());
        assert_eq!(tunnel.local_bind_port(), Some(1234));

        tunnel.kill();
        assert!(!tunnel.is_active());
        assert_eq!(tunnel.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_client_connack_on_first_pump() {
        let connector = MockConnector::new();
        let mut client = connector.create();

        assert!(client.pump(Duration::ZERO).await.is_empty());
        client.connect("broker", 1883).await.unwrap();
        assert_eq!(
            client.pump(Duration::ZERO).await,
            vec![SessionEvent::Connected]
        );
        assert!(client.pump(Duration::ZERO).await.is_empty());
    }

    #[tokio::test]
    async fn test_mock_client_kick_ends_session() {
        let connector = MockConnector::new();
        let probe = connector.probe();
        let mut client = connector.create();
        client.connect("broker", 1883).await.unwrap();
        client.pump(Duration::ZERO).await;

        probe.kick(0x80);
        assert_eq!(
            client.pump(Duration::ZERO).await,
            vec![SessionEvent::Disconnected { reason_code: 0x80 }]
        );
        assert!(client.subscriber().is_none());
    }

    #[tokio::test]
    async fn test_failing_connector() {
        let connector = MockConnector::with_failure();
        let mut client = connector.create();
        assert!(client.connect("broker", 1883).await.is_err());
        assert!(client.subscriber().is_none());
        assert_eq!(connector.probe().connect_attempts().len(), 1);
    }

    #[test]
    fn test_recording_subscriber() {
        let subscriber = RecordingSubscriber::default();
        subscriber.subscribe("a", QoS::AtLeastOnce).unwrap();
        assert_eq!(subscriber.calls(), vec![("a".to_string(), QoS::AtLeastOnce)]);
        assert!(RecordingSubscriber::failing()
            .subscribe("a", QoS::AtMostOnce)
            .is_err());
    }
}
