//! Pure routing of rumqttc events into session events

use crate::transport::{
    Message, SessionEvent, REASON_NORMAL_DISCONNECT, REASON_UNSPECIFIED_ERROR,
};
use rumqttc::v5::mqttbytes::v5::{DisconnectReasonCode, Packet};
use rumqttc::v5::Event;
use tracing::debug;

/// Map a rumqttc event to the session event it represents, if any
///
/// Outgoing traffic, acks and pings are infrastructure and produce nothing.
pub fn route_mqtt_event(event: &Event) -> Option<SessionEvent> {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => Some(SessionEvent::Connected),
        Event::Incoming(Packet::Publish(publish)) => Some(SessionEvent::Message(Message {
            topic: String::from_utf8_lossy(&publish.topic).to_string(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
        })),
        Event::Incoming(Packet::Disconnect(disconnect)) => {
            let reason_code = match disconnect.reason_code {
                DisconnectReasonCode::NormalDisconnection => REASON_NORMAL_DISCONNECT,
                _ => REASON_UNSPECIFIED_ERROR,
            };
            debug!(target: "mqtt_link", "Broker sent DISCONNECT: {:?}", disconnect.reason_code);
            Some(SessionEvent::Disconnected { reason_code })
        }
        Event::Incoming(other) => {
            debug!(target: "mqtt_link", "MQTT event: {:?}", other);
            None
        }
        Event::Outgoing(_) => None,
    }
}
