//! Ordered, deduplicated subscription set
//!
//! Broker sessions do not keep subscriptions across a reconnect, so every
//! entry here is replayed whenever the broker acknowledges a connection.

use crate::transport::Subscriber;
use rumqttc::v5::mqttbytes::QoS;
use tracing::debug;

/// A topic filter with the quality of service it was requested at
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }

    /// Build a subscription from loosely typed input
    ///
    /// Returns `None` when the topic is not UTF-8, the topic is empty, or
    /// the qos is not one of 0, 1, 2.
    pub fn parse(topic: &[u8], qos: i64) -> Option<Self> {
        let topic = std::str::from_utf8(topic).ok()?;
        if topic.is_empty() {
            return None;
        }
        Some(Self::new(topic, qos_from_level(qos)?))
    }
}

/// Map an integer level to a QoS
pub fn qos_from_level(level: i64) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Integer level of a QoS
pub fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

#[derive(Debug, Default, Clone)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with `initial`, duplicates collapsed
    pub fn with_entries(initial: impl IntoIterator<Item = Subscription>) -> Self {
        let mut registry = Self::new();
        for subscription in initial {
            registry.insert(subscription);
        }
        registry
    }

    /// Insert unless an identical (topic, qos) pair exists; true when added
    pub fn insert(&mut self, subscription: Subscription) -> bool {
        if self.entries.contains(&subscription) {
            debug!(topic = %subscription.topic, "Subscription already registered");
            return false;
        }
        self.entries.push(subscription);
        true
    }

    /// Entries in first-insertion order
    pub fn all(&self) -> &[Subscription] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Submit every entry to `subscriber`, in order, once each
    ///
    /// Failures are logged and skipped; the broker treats repeated
    /// subscribes as idempotent so a later replay repairs any gap.
    /// Returns the number of accepted subscribe calls.
    pub fn replay(&self, subscriber: &dyn Subscriber) -> usize {
        let mut accepted = 0;
        for subscription in &self.entries {
            match subscriber.subscribe(&subscription.topic, subscription.qos) {
                Ok(()) => {
                    accepted += 1;
                    debug!(
                        target: "mqtt_link",
                        qos = qos_level(subscription.qos),
                        "Subscribed to: {}", subscription.topic
                    );
                }
                Err(e) => {
                    debug!(target: "mqtt_link", "Subscribe to {} failed: {}", subscription.topic, e);
                }
            }
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSubscriber;

    #[test]
    fn test_parse_accepts_valid_input() {
        let sub = Subscription::parse(b"sensors/+/temp", 1).unwrap();
        assert_eq!(sub.topic, "sensors/+/temp");
        assert_eq!(sub.qos, QoS::AtLeastOnce);
    }

    #[test]
    fn test_parse_rejects_invalid_utf8() {
        assert!(Subscription::parse(&[0xff, 0xfe, b'a'], 0).is_none());
    }

    #[test]
    fn test_parse_rejects_empty_topic() {
        assert!(Subscription::parse(b"", 0).is_none());
    }

    #[test]
    fn test_parse_rejects_out_of_range_qos() {
        assert!(Subscription::parse(b"a", -1).is_none());
        assert!(Subscription::parse(b"a", 3).is_none());
        assert!(Subscription::parse(b"a", i64::MAX).is_none());
    }

    #[test]
    fn test_qos_level_round_trip() {
        for level in 0..=2 {
            let qos = qos_from_level(level).unwrap();
            assert_eq!(i64::from(qos_level(qos)), level);
        }
    }

    #[test]
    fn test_insert_deduplicates_exact_pairs() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.insert(Subscription::new("a", QoS::AtMostOnce)));
        assert!(!registry.insert(Subscription::new("a", QoS::AtMostOnce)));
        // same topic at a different qos is a distinct entry
        assert!(registry.insert(Subscription::new("a", QoS::AtLeastOnce)));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_with_entries_collapses_duplicates() {
        let registry = SubscriptionRegistry::with_entries(vec![
            Subscription::new("x", QoS::AtMostOnce),
            Subscription::new("y", QoS::ExactlyOnce),
            Subscription::new("x", QoS::AtMostOnce),
        ]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.all()[0].topic, "x");
        assert_eq!(registry.all()[1].topic, "y");
    }

    #[test]
    fn test_replay_preserves_insertion_order() {
        let registry = SubscriptionRegistry::with_entries(vec![
            Subscription::new("c", QoS::AtMostOnce),
            Subscription::new("a", QoS::ExactlyOnce),
            Subscription::new("b", QoS::AtLeastOnce),
        ]);
        let subscriber = RecordingSubscriber::default();

        assert_eq!(registry.replay(&subscriber), 3);
        assert_eq!(
            subscriber.calls(),
            vec![
                ("c".to_string(), QoS::AtMostOnce),
                ("a".to_string(), QoS::ExactlyOnce),
                ("b".to_string(), QoS::AtLeastOnce),
            ]
        );
    }

    #[test]
    fn test_replay_continues_after_failures() {
        let registry = SubscriptionRegistry::with_entries(vec![
            Subscription::new("a", QoS::AtMostOnce),
            Subscription::new("b", QoS::AtMostOnce),
        ]);
        let subscriber = RecordingSubscriber::failing();

        assert_eq!(registry.replay(&subscriber), 0);
        assert_eq!(subscriber.calls().len(), 2);
    }

    #[test]
    fn test_empty_registry() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.replay(&RecordingSubscriber::default()), 0);
    }
}
