use std::sync::{Arc, Mutex};

use crate::protocol::DevosEvent;

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`subscribe`] creates a new receiver that will receive all
/// messages published after the subscription was created. The bus is
/// thread-safe and can be cloned cheaply (it wraps its internals in an `Arc`).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<DevosEvent>>>>,
}

impl EventBus {
    /// Create a new, empty event bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<DevosEvent> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.push(tx);
        rx
    }

    /// Publish an event to all current subscribers, pruning any whose
    /// receiver has been dropped.
    pub fn publish(&self, event: DevosEvent) {
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorPayload, StoryUnblockedPayload};
    use chrono::Utc;

    #[test]
    fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        bus.publish(DevosEvent::Error(ErrorPayload {
            message: "boom".into(),
            timestamp: Utc::now(),
        }));
        let received = rx.try_recv().unwrap();
        match received {
            DevosEvent::Error(p) => assert_eq!(p.message, "boom"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn dropped_receiver_is_pruned_on_next_publish() {
        let bus = EventBus::new();
        {
            let _rx = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 1);
        }
        bus.publish(DevosEvent::StoryChanged(crate::protocol::StoryChangedPayload {
            workspace_id: "W1".into(),
            story_id: "S1".into(),
            change_type: crate::protocol::StoryChangeType::Updated,
            timestamp: Utc::now(),
        }));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn multiple_subscribers_all_receive() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        bus.publish(DevosEvent::OrchestratorStoryUnblocked(StoryUnblockedPayload {
            workspace_id: "W1".into(),
            story_id: "S2".into(),
            timestamp: Utc::now(),
        }));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }
}
