//! Unified event feed delivered to consumers.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One decoded frame from a data channel.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    /// Logical stream name.
    pub stream: String,
    /// Namespace of the channel that produced the frame.
    pub namespace: Option<String>,
    /// The decoded JSON object.
    pub message: Value,
}

/// Receiving end of the event feed.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl EventReceiver {
    /// Waits for the next event. Returns `None` once the engine is gone.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Returns an event if one is ready.
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }
}

/// Fan-out of events to every registered consumer.
///
/// Per-consumer queues are unbounded so a slow consumer never reorders or
/// drops another consumer's events.
#[derive(Debug, Clone, Default)]
pub struct EventFeed {
    consumers: Arc<Mutex<Vec<mpsc::UnboundedSender<StreamEvent>>>>,
}

impl EventFeed {
    /// Creates a feed with no consumers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new consumer.
    pub fn register(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.consumers.lock().push(tx);
        EventReceiver { rx }
    }

    /// Delivers an event to every live consumer, pruning dropped ones.
    pub fn publish(&self, event: StreamEvent) {
        self.consumers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Drops every consumer; their receivers then yield `None`.
    pub fn close(&self) {
        self.consumers.lock().clear();
    }

    /// Number of live consumers.
    pub fn consumer_count(&self) -> usize {
        let mut consumers = self.consumers.lock();
        consumers.retain(|tx| !tx.is_closed());
        consumers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(n: u64) -> StreamEvent {
        StreamEvent {
            stream: "alarms".into(),
            namespace: None,
            message: json!({ "n": n }),
        }
    }

    #[test]
    fn every_consumer_sees_every_event_in_order() {
        let feed = EventFeed::new();
        let mut a = feed.register();
        let mut b = feed.register();
        feed.publish(event(1));
        feed.publish(event(2));

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.try_recv().unwrap().message["n"], 1);
            assert_eq!(rx.try_recv().unwrap().message["n"], 2);
            assert!(rx.try_recv().is_none());
        }
    }

    #[test]
    fn dropped_consumers_are_pruned() {
        let feed = EventFeed::new();
        let a = feed.register();
        let _b = feed.register();
        drop(a);
        feed.publish(event(1));
        assert_eq!(feed.consumer_count(), 1);
    }

    #[tokio::test]
    async fn close_ends_receivers() {
        let feed = EventFeed::new();
        let mut rx = feed.register();
        feed.close();
        assert!(rx.recv().await.is_none());
    }
}
