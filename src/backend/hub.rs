use super::{ChangeChannel, ChangeEvent, Subscription};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// In-process fan-out of change events to topic subscribers.
///
/// Delivery is at-most-once: a subscriber whose receiver is gone is pruned on
/// the next publish to its topic.
#[derive(Clone, Default)]
pub struct ChangeHub {
    inner: Arc<Mutex<HubInner>>,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber>,
}

struct Subscriber {
    topic: String,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl ChangeHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver `event` to every live subscriber of `topic`.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, topic: &str, event: ChangeEvent) -> usize {
        let mut inner = self.lock();
        let mut delivered = 0;
        inner.subscribers.retain(|_, sub| {
            if sub.topic != topic {
                return true;
            }
            match sub.tx.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        tracing::debug!(topic = %topic, event = event.kind(), id = %event.id(), delivered, "Published change event");
        delivered
    }

    /// Number of live subscriptions on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .subscribers
            .values()
            .filter(|s| s.topic == topic)
            .count()
    }
}

impl ChangeChannel for ChangeHub {
    fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subscribers.insert(
                id,
                Subscriber {
                    topic: topic.to_string(),
                    tx,
                },
            );
            id
        };
        tracing::debug!(topic = %topic, subscription = id, "Subscribed");

        let hub = self.clone();
        Subscription::new(topic, rx, move || {
            hub.lock().subscribers.remove(&id);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_only_matching_topic() {
        let hub = ChangeHub::new();
        let mut a = hub.subscribe("notifications:a");
        let mut b = hub.subscribe("notifications:b");

        let delivered = hub.publish("notifications:a", ChangeEvent::Delete { id: "x".into() });
        assert_eq!(delivered, 1);
        assert_eq!(a.recv().await, Some(ChangeEvent::Delete { id: "x".into() }));

        hub.publish("notifications:b", ChangeEvent::Delete { id: "y".into() });
        assert_eq!(b.recv().await, Some(ChangeEvent::Delete { id: "y".into() }));
    }

    #[test]
    fn test_unsubscribe_removes_subscriber() {
        let hub = ChangeHub::new();
        let sub = hub.subscribe("t");
        assert_eq!(hub.subscriber_count("t"), 1);
        sub.unsubscribe();
        assert_eq!(hub.subscriber_count("t"), 0);
        assert_eq!(hub.publish("t", ChangeEvent::Delete { id: "x".into() }), 0);
    }

    #[test]
    fn test_drop_removes_subscriber() {
        let hub = ChangeHub::new();
        {
            let _sub = hub.subscribe("t");
            assert_eq!(hub.subscriber_count("t"), 1);
        }
        assert_eq!(hub.subscriber_count("t"), 0);
    }
}
