//! Ownership of at most one broker client and routing of its events

use crate::config::Credentials;
use crate::error::BrokerError;
use crate::link::dispatch::SharedLink;
use crate::transport::{
    BrokerClient, BrokerConnector, SessionEvent, REASON_NORMAL_DISCONNECT,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// The manager's broker session
///
/// A fresh client object is created for every connection attempt. The
/// session-open flag in [`SharedLink`] is written only while routing
/// connect and disconnect events.
pub struct BrokerSession {
    client: Option<Box<dyn BrokerClient>>,
    shared: Arc<SharedLink>,
    log_enabled: bool,
}

impl BrokerSession {
    pub fn new(shared: Arc<SharedLink>, log_enabled: bool) -> Self {
        Self {
            client: None,
            shared,
            log_enabled,
        }
    }

    /// Discard any previous client and connect a new one
    ///
    /// A client whose connect fails is dropped; the caller decides whether
    /// to retry.
    pub async fn open(
        &mut self,
        connector: &dyn BrokerConnector,
        host: &str,
        port: u16,
        credentials: Option<&Credentials>,
    ) -> Result<(), BrokerError> {
        self.teardown().await;

        let mut client = connector.create();
        if let Some(credentials) = credentials {
            client.set_credentials(&credentials.username, &credentials.password);
        }
        debug!(
            target: "mqtt_link",
            client_id = %client.client_id(),
            "Connecting to {}:{}", host, port
        );
        client.connect(host, port).await?;

        self.shared.dispatch.lock().await.subscriber = client.subscriber();
        self.client = Some(client);
        Ok(())
    }

    /// Service network I/O for up to `timeout`, routing whatever arrives
    pub async fn pump(&mut self, timeout: Duration) {
        let events = match self.client.as_mut() {
            Some(client) => client.pump(timeout).await,
            None => return,
        };
        for event in events {
            route_event(&self.shared, self.log_enabled, event).await;
        }
    }

    /// Request a clean disconnect and discard the client
    pub async fn teardown(&mut self) {
        let Some(mut client) = self.client.take() else {
            return;
        };
        self.shared.dispatch.lock().await.subscriber = None;

        if let Err(e) = client.disconnect().await {
            debug!(target: "mqtt_link", "Ignoring disconnect error: {}", e);
        }
        route_event(
            &self.shared,
            self.log_enabled,
            SessionEvent::Disconnected {
                reason_code: REASON_NORMAL_DISCONNECT,
            },
        )
        .await;
    }

    pub fn is_open(&self) -> bool {
        self.shared.session_open()
    }

    pub fn is_present(&self) -> bool {
        self.client.is_some()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client.as_ref().map(|client| client.client_id())
    }
}

async fn route_event(shared: &SharedLink, log_enabled: bool, event: SessionEvent) {
    match event {
        SessionEvent::Connected => {
            shared.set_session_open(true);
            if log_enabled {
                info!(target: "mqtt_link", "MQTT: Connected!");
            } else {
                debug!(target: "mqtt_link", "MQTT: Connected!");
            }
            let replayed = shared.dispatch.lock().await.replay();
            debug!(target: "mqtt_link", replayed, "Subscriptions resubmitted");
        }
        SessionEvent::Disconnected { reason_code } => {
            shared.set_session_open(false);
            if reason_code == REASON_NORMAL_DISCONNECT {
                return;
            }
            if log_enabled {
                error!(target: "mqtt_link", reason_code, "MQTT: Unexpected disconnection.");
            } else {
                debug!(target: "mqtt_link", reason_code, "MQTT: Unexpected disconnection.");
            }
        }
        SessionEvent::Message(message) => {
            shared.dispatch.lock().await.deliver(&message);
        }
    }
}
