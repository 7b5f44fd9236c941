//! Named, cancelable one-shot timers for the connection FSM.
//!
//! Each timer kind has a generation counter. Arming or canceling bumps the
//! generation, and a fire carries the generation it was armed with, so the
//! worker can discard fires that lost a race with cancellation — a timer
//! settles at most once per arming. Timers run on tokio's clock, which tests
//! pause and advance virtually.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::trace;

use crate::fsm::queue::EventQueue;
use crate::fsm::Event;

/// The named timers a connection owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Bounds the application-level handshake.
    Handshake,
    /// Fires when the peer's DAT validity runs out.
    Dat,
    /// Watchdog for an attestation round, or — while established — the
    /// re-attestation refresh trigger.
    Rat,
}

impl TimerKind {
    fn index(self) -> usize {
        match self {
            TimerKind::Handshake => 0,
            TimerKind::Dat => 1,
            TimerKind::Rat => 2,
        }
    }

    const ALL: [TimerKind; 3] = [TimerKind::Handshake, TimerKind::Dat, TimerKind::Rat];
}

struct Slot {
    generation: u64,
    abort: Option<AbortHandle>,
}

/// Per-connection timer service. Owned and driven exclusively by the
/// connection worker.
pub(crate) struct TimerService {
    events: Arc<EventQueue>,
    slots: [Slot; 3],
}

impl TimerService {
    pub(crate) fn new(events: Arc<EventQueue>) -> Self {
        Self {
            events,
            slots: std::array::from_fn(|_| Slot {
                generation: 0,
                abort: None,
            }),
        }
    }

    /// Arm `kind` to fire after `duration`, superseding any previous arming
    /// of the same kind.
    pub(crate) fn start(&mut self, kind: TimerKind, duration: Duration) {
        let slot = &mut self.slots[kind.index()];
        if let Some(abort) = slot.abort.take() {
            abort.abort();
        }
        slot.generation += 1;
        let generation = slot.generation;

        trace!(?kind, ?duration, generation, "timer armed");
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            events.push(Event::Timeout { kind, generation });
        });
        slot.abort = Some(task.abort_handle());
    }

    /// Disarm `kind`. In-flight fires of the previous arming become stale.
    pub(crate) fn cancel(&mut self, kind: TimerKind) {
        let slot = &mut self.slots[kind.index()];
        if let Some(abort) = slot.abort.take() {
            abort.abort();
        }
        slot.generation += 1;
    }

    pub(crate) fn cancel_all(&mut self) {
        for kind in TimerKind::ALL {
            self.cancel(kind);
        }
    }

    /// Whether a fire with this generation is still current.
    pub(crate) fn is_current(&self, kind: TimerKind, generation: u64) -> bool {
        self.slots[kind.index()].generation == generation
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let Some(abort) = slot.abort.take() {
                abort.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_with_current_generation() {
        let events = Arc::new(EventQueue::new(8));
        let mut timers = TimerService::new(events.clone());

        timers.start(TimerKind::Handshake, Duration::from_millis(50));

        match events.recv().await {
            Event::Timeout { kind, generation } => {
                assert_eq!(kind, TimerKind::Handshake);
                assert!(timers.is_current(kind, generation));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restart_supersedes_previous_arming() {
        let events = Arc::new(EventQueue::new(8));
        let mut timers = TimerService::new(events.clone());

        timers.start(TimerKind::Rat, Duration::from_millis(10));
        timers.start(TimerKind::Rat, Duration::from_millis(10));

        match events.recv().await {
            Event::Timeout { kind, generation } => {
                assert!(timers.is_current(kind, generation));
                assert_eq!(generation, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_makes_inflight_fire_stale() {
        let events = Arc::new(EventQueue::new(8));
        let mut timers = TimerService::new(events.clone());

        timers.start(TimerKind::Dat, Duration::from_millis(10));
        timers.cancel(TimerKind::Dat);

        // Nothing may fire; give the (aborted) task time to have fired.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(events.len(), 0);
        assert!(!timers.is_current(TimerKind::Dat, 1));
    }
}
