//! State shared between the worker, broker events and caller tasks
//!
//! Only two things cross task boundaries: the session-open flag, written by
//! broker event routing, and the [`Dispatch`] block, which holds everything
//! a message handler or a subscribe call may touch. The dispatch mutex
//! serializes handler invocations against each other and against facade
//! operations.

use crate::link::subscriptions::{Subscription, SubscriptionRegistry};
use crate::transport::{Message, Subscriber};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Caller-supplied function invoked for every received message
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

pub struct Dispatch {
    pub subscriptions: SubscriptionRegistry,
    /// Subscribe handle of the current broker client, if any
    pub subscriber: Option<Arc<dyn Subscriber>>,
    pub handler: Option<MessageHandler>,
}

impl Dispatch {
    /// Register `subscription`; on a new entry, resubmit the whole registry
    /// to the current session. True when the registry grew.
    pub fn add(&mut self, subscription: Subscription) -> bool {
        if !self.subscriptions.insert(subscription) {
            return false;
        }
        self.replay();
        true
    }

    /// Resubmit every subscription to the current session, if one exists
    pub fn replay(&self) -> usize {
        match &self.subscriber {
            Some(subscriber) => self.subscriptions.replay(subscriber.as_ref()),
            None => 0,
        }
    }

    /// Hand `message` to the handler, if one is installed
    pub fn deliver(&self, message: &Message) {
        if let Some(handler) = &self.handler {
            handler(message);
        }
    }
}

pub struct SharedLink {
    session_open: AtomicBool,
    pub dispatch: Mutex<Dispatch>,
}

impl SharedLink {
    pub fn new(subscriptions: SubscriptionRegistry, handler: Option<MessageHandler>) -> Self {
        Self {
            session_open: AtomicBool::new(false),
            dispatch: Mutex::new(Dispatch {
                subscriptions,
                subscriber: None,
                handler,
            }),
        }
    }

    /// Broker-level session flag, as last reported by connect/disconnect events
    pub fn session_open(&self) -> bool {
        self.session_open.load(Ordering::SeqCst)
    }

    pub(crate) fn set_session_open(&self, open: bool) {
        self.session_open.store(open, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSubscriber;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::QoS;
    use std::sync::atomic::AtomicUsize;

    fn dispatch_with(subscriber: Option<Arc<dyn Subscriber>>) -> Dispatch {
        Dispatch {
            subscriptions: SubscriptionRegistry::new(),
            subscriber,
            handler: None,
        }
    }

    #[test]
    fn test_add_without_session_only_registers() {
        let mut dispatch = dispatch_with(None);
        assert!(dispatch.add(Subscription::new("a", QoS::AtMostOnce)));
        assert_eq!(dispatch.subscriptions.len(), 1);
        assert_eq!(dispatch.replay(), 0);
    }

    #[test]
    fn test_add_resubmits_all_entries() {
        let subscriber = Arc::new(RecordingSubscriber::default());
        let mut dispatch = dispatch_with(Some(subscriber.clone()));

        dispatch.add(Subscription::new("a", QoS::AtMostOnce));
        dispatch.add(Subscription::new("b", QoS::AtLeastOnce));

        let topics: Vec<String> = subscriber.calls().into_iter().map(|(t, _)| t).collect();
        assert_eq!(topics, vec!["a", "a", "b"]);
    }

    #[test]
    fn test_duplicate_add_issues_no_subscribe() {
        let subscriber = Arc::new(RecordingSubscriber::default());
        let mut dispatch = dispatch_with(Some(subscriber.clone()));

        assert!(dispatch.add(Subscription::new("a", QoS::AtMostOnce)));
        assert!(!dispatch.add(Subscription::new("a", QoS::AtMostOnce)));

        assert_eq!(subscriber.calls().len(), 1);
        assert_eq!(dispatch.subscriptions.len(), 1);
    }

    #[test]
    fn test_deliver_invokes_handler() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let mut dispatch = dispatch_with(None);
        dispatch.handler = Some(Arc::new(move |_message: &Message| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let message = Message {
            topic: "t".to_string(),
            payload: Bytes::from_static(b"x"),
            qos: QoS::AtMostOnce,
            retain: false,
        };
        dispatch.deliver(&message);
        dispatch.deliver(&message);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_deliver_without_handler_is_noop() {
        let dispatch = dispatch_with(None);
        dispatch.deliver(&Message {
            topic: "t".to_string(),
            payload: Bytes::new(),
            qos: QoS::AtMostOnce,
            retain: false,
        });
    }

    #[test]
    fn test_session_flag_starts_closed() {
        let shared = SharedLink::new(SubscriptionRegistry::new(), None);
        assert!(!shared.session_open());
        shared.set_session_open(true);
        assert!(shared.session_open());
    }
}
