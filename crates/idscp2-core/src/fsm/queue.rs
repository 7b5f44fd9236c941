//! The per-connection event queue.
//!
//! All event sources — channel reader, timers, driver tasks, the user
//! facade — push into one queue; a single worker drains it, which is what
//! makes FSM transitions atomic without locking connection state.
//!
//! The queue is bounded. When full, the oldest pending timer event is
//! dropped to make room; wire and user events are always accepted even if
//! that temporarily exceeds the capacity, because dropping a wire event
//! would desynchronize the protocol.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::debug;

use crate::fsm::Event;

pub(crate) struct EventQueue {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
}

impl EventQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue an event for the worker. Never blocks.
    pub(crate) fn push(&self, event: Event) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                if let Some(pos) = queue.iter().position(Event::is_timer) {
                    let dropped = queue.remove(pos);
                    debug!(?dropped, "event queue full, dropping oldest timer event");
                }
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Wait for and dequeue the next event.
    pub(crate) async fn recv(&self) -> Event {
        loop {
            if let Some(event) = self.queue.lock().unwrap().pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::TimerKind;

    fn timer_event() -> Event {
        Event::Timeout {
            kind: TimerKind::Rat,
            generation: 1,
        }
    }

    fn wire_event() -> Event {
        Event::FromPeer(idscp2_proto::wire::Body::Data(
            idscp2_proto::wire::IdscpData {
                payload: Vec::new(),
            },
        ))
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let queue = EventQueue::new(8);
        queue.push(Event::Start);
        queue.push(Event::UserClose);

        assert!(matches!(queue.recv().await, Event::Start));
        assert!(matches!(queue.recv().await, Event::UserClose));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_timer_event_first() {
        let queue = EventQueue::new(4);
        queue.push(wire_event());
        queue.push(timer_event());
        queue.push(Event::Timeout {
            kind: TimerKind::Dat,
            generation: 7,
        });
        queue.push(wire_event());
        assert_eq!(queue.len(), 4);

        queue.push(wire_event());
        assert_eq!(queue.len(), 4);

        // The Rat timeout (oldest timer event) is gone, the Dat one remains.
        assert!(matches!(queue.recv().await, Event::FromPeer(_)));
        assert!(matches!(
            queue.recv().await,
            Event::Timeout {
                kind: TimerKind::Dat,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn wire_events_are_never_dropped() {
        let queue = EventQueue::new(2);
        for _ in 0..5 {
            queue.push(wire_event());
        }
        // No timer events to evict: the queue grows past capacity instead.
        assert_eq!(queue.len(), 5);
    }
}
