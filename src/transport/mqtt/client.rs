//! Impure I/O against the rumqttc event loop
//!
//! rumqttc connects lazily on the first `poll`, so [`RumqttClient::connect`]
//! drives that first poll itself and keeps the resulting ConnAck for the
//! next pump. Transport errors end the client: the event loop is dropped so
//! rumqttc's built-in reconnect never races the connection manager.
//!
//! Subscribe requests are queued and fed into the bounded request channel
//! between event loop polls, so a registry larger than the channel is still
//! submitted in full.

use super::connection::{configure_mqtt_options, generate_client_id};
use super::event_router::route_mqtt_event;
use crate::config::Credentials;
use crate::error::{redact_secrets, BrokerError};
use crate::transport::{
    BrokerClient, BrokerConnector, SessionEvent, Subscriber, REASON_UNSPECIFIED_ERROR,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::{valid_filter, QoS};
use rumqttc::v5::{AsyncClient, EventLoop};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Request channel capacity between `AsyncClient` and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Upper bound on polling after a disconnect request
const DISCONNECT_FLUSH: Duration = Duration::from_millis(250);

/// Creates one [`RumqttClient`] per connection attempt
#[derive(Debug, Clone)]
pub struct RumqttConnector {
    client_id_prefix: String,
    keep_alive: Duration,
    connect_timeout: Duration,
}

impl RumqttConnector {
    pub fn new(client_id_prefix: impl Into<String>, keep_alive: Duration, connect_timeout: Duration) -> Self {
        Self {
            client_id_prefix: client_id_prefix.into(),
            keep_alive,
            connect_timeout,
        }
    }
}

impl BrokerConnector for RumqttConnector {
    fn create(&self) -> Box<dyn BrokerClient> {
        Box::new(RumqttClient::new(
            generate_client_id(&self.client_id_prefix),
            self.keep_alive,
            self.connect_timeout,
        ))
    }
}

/// Broker client backed by `rumqttc::v5`
pub struct RumqttClient {
    client_id: String,
    credentials: Option<Credentials>,
    keep_alive: Duration,
    connect_timeout: Duration,
    client: Option<AsyncClient>,
    event_loop: Option<EventLoop>,
    pending: Vec<SessionEvent>,
    subscribe_queue: SubscribeQueue,
}

impl RumqttClient {
    pub fn new(client_id: String, keep_alive: Duration, connect_timeout: Duration) -> Self {
        Self {
            client_id,
            credentials: None,
            keep_alive,
            connect_timeout,
            client: None,
            event_loop: None,
            pending: Vec::new(),
            subscribe_queue: SubscribeQueue::default(),
        }
    }
}

#[async_trait]
impl BrokerClient for RumqttClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn set_credentials(&mut self, username: &str, password: &str) {
        self.credentials = Some(Credentials::new(username, password));
    }

    async fn connect(&mut self, host: &str, port: u16) -> Result<(), BrokerError> {
        let options = configure_mqtt_options(
            &self.client_id,
            host,
            port,
            self.credentials.as_ref(),
            self.keep_alive,
        );
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        let first_event = tokio::time::timeout(self.connect_timeout, event_loop.poll())
            .await
            .map_err(|_| BrokerError::Timeout(self.connect_timeout))?
            .map_err(|e| BrokerError::ConnectionFailed(redact_secrets(&e.to_string())))?;

        debug!(target: "mqtt_link", client_id = %self.client_id, "Connected to {}:{}", host, port);
        if let Some(event) = route_mqtt_event(&first_event) {
            self.pending.push(event);
        }
        self.client = Some(client);
        self.event_loop = Some(event_loop);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        let result = client
            .try_disconnect()
            .map_err(|e| BrokerError::DisconnectFailed(Box::new(e)));

        // the DISCONNECT packet only leaves when the event loop is polled
        if let Some(mut event_loop) = self.event_loop.take() {
            let deadline = tokio::time::Instant::now() + DISCONNECT_FLUSH;
            while let Ok(Ok(_)) = tokio::time::timeout_at(deadline, event_loop.poll()).await {}
        }
        self.pending.clear();
        self.subscribe_queue.clear();
        result
    }

    async fn pump(&mut self, timeout: Duration) -> Vec<SessionEvent> {
        let mut events = std::mem::take(&mut self.pending);
        let Some(event_loop) = self.event_loop.as_mut() else {
            return events;
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(client) = self.client.as_ref() {
                self.subscribe_queue.flush(client);
            }
            match tokio::time::timeout_at(deadline, event_loop.poll()).await {
                Err(_) => break,
                Ok(Ok(event)) => {
                    if let Some(session_event) = route_mqtt_event(&event) {
                        events.push(session_event);
                    }
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "mqtt_link",
                        client_id = %self.client_id,
                        "MQTT event loop error: {}",
                        redact_secrets(&e.to_string())
                    );
                    events.push(SessionEvent::Disconnected {
                        reason_code: REASON_UNSPECIFIED_ERROR,
                    });
                    self.event_loop = None;
                    break;
                }
            }
        }
        events
    }

    fn subscriber(&self) -> Option<Arc<dyn Subscriber>> {
        self.client
            .as_ref()
            .map(|client| {
                Arc::new(RumqttSubscriber {
                    client: client.clone(),
                    queue: self.subscribe_queue.clone(),
                }) as Arc<dyn Subscriber>
            })
    }
}

/// Subscribe requests waiting for room in the request channel
#[derive(Debug, Clone, Default)]
struct SubscribeQueue(Arc<Mutex<VecDeque<(String, QoS)>>>);

impl SubscribeQueue {
    fn push(&self, topic: &str, qos: QoS) {
        if let Ok(mut queue) = self.0.lock() {
            queue.push_back((topic.to_string(), qos));
        }
    }

    /// Move queued requests into the channel until it is full
    fn flush(&self, client: &AsyncClient) {
        let Ok(mut queue) = self.0.lock() else {
            return;
        };
        while let Some((topic, qos)) = queue.pop_front() {
            if client.try_subscribe(topic.clone(), qos).is_err() {
                queue.push_front((topic, qos));
                break;
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    fn clear(&self) {
        if let Ok(mut queue) = self.0.lock() {
            queue.clear();
        }
    }
}

/// Subscribe handle sharing the client's request channel and queue
struct RumqttSubscriber {
    client: AsyncClient,
    queue: SubscribeQueue,
}

impl Subscriber for RumqttSubscriber {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        if !valid_filter(topic) {
            return Err(BrokerError::SubscriptionFailed {
                topic: topic.to_string(),
                source: format!("invalid topic filter {:?}", topic).into(),
            });
        }
        self.queue.push(topic, qos);
        self.queue.flush(&self.client);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// MQTT v5 CONNACK: no session present, success, empty properties
    const CONNACK: [u8; 5] = [0x20, 0x03, 0x00, 0x00, 0x00];
    const SUBSCRIBE_HEADER: u8 = 0x82;

    async fn read_packet(stream: &mut TcpStream) -> Option<u8> {
        let header = stream.read_u8().await.ok()?;
        let (mut length, mut shift) = (0usize, 0);
        loop {
            let byte = stream.read_u8().await.ok()?;
            length |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).await.ok()?;
        Some(header)
    }

    /// Accepts one client, acknowledges CONNECT and counts SUBSCRIBE packets
    async fn counting_broker() -> (u16, tokio::task::JoinHandle<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_packet(&mut stream).await.unwrap();
            stream.write_all(&CONNACK).await.unwrap();
            let mut subscribes = 0;
            while let Some(header) = read_packet(&mut stream).await {
                if header == SUBSCRIBE_HEADER {
                    subscribes += 1;
                }
            }
            subscribes
        });
        (port, task)
    }

    fn test_client() -> RumqttClient {
        RumqttClient::new(
            "test-client".to_string(),
            Duration::from_secs(60),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn test_connector_creates_distinct_clients() {
        let connector = RumqttConnector::new(
            "mqttlink",
            Duration::from_secs(60),
            Duration::from_secs(5),
        );
        let first = connector.create();
        let second = connector.create();
        assert!(first.client_id().starts_with("mqttlink-"));
        assert_ne!(first.client_id(), second.client_id());
    }

    #[test]
    fn test_no_subscriber_before_connect() {
        assert!(test_client().subscriber().is_none());
    }

    #[tokio::test]
    async fn test_pump_without_connection_returns_nothing() {
        let mut client = test_client();
        let events = client.pump(Duration::from_millis(10)).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_ok() {
        let mut client = test_client();
        assert!(client.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        // bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = test_client();
        let result = client.connect("127.0.0.1", port).await;
        assert!(result.is_err());
        assert!(client.subscriber().is_none());
    }

    #[tokio::test]
    async fn test_subscriptions_beyond_channel_capacity_all_reach_broker() {
        let (port, broker) = counting_broker().await;
        let mut client = test_client();
        client.connect("127.0.0.1", port).await.unwrap();
        let subscriber = client.subscriber().unwrap();

        let total = REQUEST_CHANNEL_CAPACITY + 5;
        for i in 0..total {
            let topic = format!("sensors/{i}");
            assert!(subscriber.subscribe(&topic, QoS::AtLeastOnce).is_ok());
        }
        assert_eq!(client.subscribe_queue.len(), total - REQUEST_CHANNEL_CAPACITY);

        client.pump(Duration::from_millis(200)).await;
        assert_eq!(client.subscribe_queue.len(), 0);

        client.disconnect().await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(2), broker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, total);
    }

    #[tokio::test]
    async fn test_invalid_filter_is_rejected_without_queueing() {
        let (port, _broker) = counting_broker().await;
        let mut client = test_client();
        client.connect("127.0.0.1", port).await.unwrap();
        let subscriber = client.subscriber().unwrap();

        let result = subscriber.subscribe("sensors/#/temperature", QoS::AtMostOnce);
        assert!(matches!(result, Err(BrokerError::SubscriptionFailed { .. })));
        assert_eq!(client.subscribe_queue.len(), 0);
    }
}
