//! Property tests for the subscription registry

use mqttlink::link::subscriptions::{qos_from_level, Subscription, SubscriptionRegistry};
use mqttlink::testing::RecordingSubscriber;
use proptest::prelude::*;

fn subscription_strategy() -> impl Strategy<Value = Subscription> {
    ("[a-c]{1,2}(/[a-c#+]{1,2})?", 0i64..=2).prop_map(|(topic, level)| {
        Subscription::new(topic, qos_from_level(level).expect("level in range"))
    })
}

proptest! {
    #[test]
    fn registry_holds_no_duplicates(entries in prop::collection::vec(subscription_strategy(), 0..40)) {
        let registry = SubscriptionRegistry::with_entries(entries.clone());
        let all = registry.all();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                prop_assert_ne!(a, b);
            }
        }
        // every input is represented
        for entry in &entries {
            prop_assert!(all.contains(entry));
        }
    }

    #[test]
    fn registry_keeps_first_insertion_order(entries in prop::collection::vec(subscription_strategy(), 0..40)) {
        let registry = SubscriptionRegistry::with_entries(entries.clone());
        let mut expected: Vec<Subscription> = Vec::new();
        for entry in entries {
            if !expected.contains(&entry) {
                expected.push(entry);
            }
        }
        prop_assert_eq!(registry.all(), expected.as_slice());
    }

    #[test]
    fn replay_submits_each_entry_once(entries in prop::collection::vec(subscription_strategy(), 0..40)) {
        let registry = SubscriptionRegistry::with_entries(entries);
        let subscriber = RecordingSubscriber::default();

        let accepted = registry.replay(&subscriber);

        let expected: Vec<(String, _)> = registry
            .all()
            .iter()
            .map(|s| (s.topic.clone(), s.qos))
            .collect();
        prop_assert_eq!(accepted, registry.len());
        prop_assert_eq!(subscriber.calls(), expected);
    }

    #[test]
    fn out_of_range_qos_never_parses(topic in "[a-z/]{1,10}", level in prop_oneof![i64::MIN..0i64, 3i64..]) {
        prop_assert!(Subscription::parse(topic.as_bytes(), level).is_none());
    }

    #[test]
    fn invalid_input_leaves_registry_unchanged(level in 3i64..1000) {
        let mut registry = SubscriptionRegistry::with_entries([
            Subscription::new("kept", qos_from_level(0).expect("level in range")),
        ]);
        if let Some(subscription) = Subscription::parse(b"kept", level) {
            registry.insert(subscription);
        }
        prop_assert_eq!(registry.len(), 1);
    }
}
