//! Long-poll event queues
//!
//! Each HTTP long-poll session owns one bounded queue fed by the dispatcher
//! on both signals. Private events never enter the queue; when the queue is
//! full the oldest element is dropped so producers never block. Reads wait
//! up to 60 seconds for a first event and then drain whatever is queued.

use crate::dispatcher::{Dispatcher, Signal};
use crate::event::KvEvent;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

pub const MAX_QUEUED_EVENTS: usize = 512;

/// How long a long-poll read waits for its first event
const POLL_TIMEOUT: Duration = Duration::from_secs(60);

pub struct EventQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    events: Mutex<VecDeque<KvEvent>>,
    notify: Notify,
}

impl EventQueue {
    /// Create a queue and register it on both dispatcher signals. The
    /// registration holds only a weak handle, so dropping the queue is
    /// enough to retire it.
    pub fn new(dispatcher: &Dispatcher) -> Self {
        let inner = Arc::new(QueueInner {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });

        for signal in [Signal::ReceivedEvent, Signal::SentEvent] {
            let weak = Arc::downgrade(&inner);
            dispatcher.connect(signal, move |event_ref| {
                if let Some(queue) = weak.upgrade() {
                    queue.push(&event_ref.event);
                }
            });
        }

        Self { inner }
    }

    pub fn len(&self) -> usize {
        self.inner.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.events.lock().is_empty()
    }

    /// Wait up to the poll timeout for a first event, then drain the queue.
    /// Returns an empty batch when the timeout lapses quietly.
    pub async fn get(&self) -> Vec<KvEvent> {
        if self.inner.events.lock().is_empty() {
            let _ = timeout(POLL_TIMEOUT, self.inner.notify.notified()).await;
        }

        self.inner.events.lock().drain(..).collect()
    }
}

impl QueueInner {
    fn push(&self, event: &KvEvent) {
        if event.is_private() {
            return;
        }

        {
            let mut events = self.events.lock();
            events.push_back(event.clone());
            if events.len() > MAX_QUEUED_EVENTS {
                events.pop_front();
            }
        }

        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventRef;
    use crate::origin::Origin;
    use serde_json::json;

    fn fire(dispatcher: &Dispatcher, origin: &Origin, key: &str, value: i64) {
        let event = KvEvent::new("o1", key, json!(value), origin);
        dispatcher.send(Signal::ReceivedEvent, &EventRef::detached(event));
    }

    #[tokio::test]
    async fn test_drains_queued_events() {
        let dispatcher = Dispatcher::new();
        let queue = EventQueue::new(&dispatcher);
        let origin = Origin::generate();

        fire(&dispatcher, &origin, "a", 1);
        fire(&dispatcher, &origin, "b", 2);

        let events = queue.get().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key, "a");
        assert_eq!(events[1].key, "b");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_private_events_excluded() {
        let dispatcher = Dispatcher::new();
        let queue = EventQueue::new(&dispatcher);
        let origin = Origin::generate();

        fire(&dispatcher, &origin, "_private", 1);
        fire(&dispatcher, &origin, "public", 2);

        let events = queue.get().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "public");
    }

    #[tokio::test]
    async fn test_capacity_drops_oldest() {
        let dispatcher = Dispatcher::new();
        let queue = EventQueue::new(&dispatcher);
        let origin = Origin::generate();

        for i in 0..(MAX_QUEUED_EVENTS as i64 + 10) {
            fire(&dispatcher, &origin, "k", i);
        }

        assert_eq!(queue.len(), MAX_QUEUED_EVENTS);
        let events = queue.get().await;
        // the first ten were dropped, not the last ten
        assert_eq!(events[0].value, json!(10));
        assert_eq!(events.last().unwrap().value, json!(MAX_QUEUED_EVENTS as i64 + 9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_poll_returns_empty() {
        let dispatcher = Dispatcher::new();
        let queue = EventQueue::new(&dispatcher);

        let events = queue.get().await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_queue_detaches() {
        let dispatcher = Dispatcher::new();
        let origin = Origin::generate();

        let queue = EventQueue::new(&dispatcher);
        drop(queue);

        // firing after the drop must not panic on the stale registration
        fire(&dispatcher, &origin, "k", 1);
    }
}
