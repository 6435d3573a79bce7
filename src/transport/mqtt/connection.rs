//! Pure MQTT option building
//!
//! Every connection attempt gets fresh options and a fresh client id so a
//! half-dead previous session can never be taken over by the new one.

use crate::config::Credentials;
use rumqttc::v5::MqttOptions;
use std::time::Duration;
use uuid::Uuid;

/// Largest packet accepted from the broker
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Client id of the form `{prefix}-{uuid}`
pub fn generate_client_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

/// Build rumqttc options for one connection attempt
pub fn configure_mqtt_options(
    client_id: &str,
    host: &str,
    port: u16,
    credentials: Option<&Credentials>,
    keep_alive: Duration,
) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if let Some(credentials) = credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    mqtt_options.set_keep_alive(keep_alive);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    mqtt_options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_uses_prefix() {
        let id = generate_client_id("mqttlink");
        assert!(id.starts_with("mqttlink-"));
        assert_eq!(id.len(), "mqttlink-".len() + 32);
    }

    #[test]
    fn test_client_ids_are_unique() {
        assert_ne!(generate_client_id("a"), generate_client_id("a"));
    }

    #[test]
    fn test_configure_options_sets_endpoint() {
        let options = configure_mqtt_options(
            "client-1",
            "127.0.0.1",
            40_000,
            None,
            Duration::from_secs(30),
        );
        assert_eq!(options.broker_address(), ("127.0.0.1".to_string(), 40_000));
        assert_eq!(options.client_id(), "client-1");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
    }

    #[test]
    fn test_configure_options_with_credentials() {
        let credentials = Credentials::new("labor", "labor");
        let options = configure_mqtt_options(
            "client-2",
            "broker.local",
            1883,
            Some(&credentials),
            Duration::from_secs(60),
        );
        assert_eq!(options.client_id(), "client-2");
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
    }
}
