//! Event bus: immutable share/block/connection records fanned out to
//! optional external sinks (stats storage, dashboards, notifications —
//! none of which live in this crate). Slow subscribers are dropped rather
//! than allowed to block the hot path.

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Bound of each subscriber's queue; a full queue means the subscriber is
/// dropped on the next publish.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ShareEvent {
    pub worker: String,
    pub share_difficulty: f64,
    pub sent_difficulty: f64,
    pub network_difficulty: f64,
    pub accepted: bool,
    pub is_block: bool,
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct BlockEvent {
    pub worker: String,
    pub height: i64,
    pub block_hash: String,
    pub accepted: bool,
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub worker: Option<String>,
    pub session_id: u64,
    pub connected: bool,
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub enum Event {
    Share(ShareEvent),
    Block(BlockEvent),
    Connection(ConnectionEvent),
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Offer an event to every subscriber; a subscriber whose queue is full
    /// is dropped from the list instead of backing up the publisher.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("dropping slow event-bus subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_subscriber_is_dropped_not_blocked() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for i in 0..SUBSCRIBER_QUEUE_CAPACITY + 10 {
            bus.publish(Event::Connection(ConnectionEvent {
                worker: None,
                session_id: i as u64,
                connected: true,
                timestamp: 0,
            }));
        }
        assert_eq!(bus.subscriber_count(), 0);
        rx.close();
    }

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::Share(ShareEvent {
            worker: "alice".into(),
            share_difficulty: 1.0,
            sent_difficulty: 1.0,
            network_difficulty: 100.0,
            accepted: true,
            is_block: false,
            timestamp: 0,
        }));
        let received = rx.recv().await.expect("event delivered");
        match received {
            Event::Share(s) => assert_eq!(s.worker, "alice"),
            _ => panic!("wrong event type"),
        }
    }
}
