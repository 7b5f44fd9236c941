//! The connection facade and its worker task.
//!
//! [`Idscp2Connection::spawn`] wires a secure channel to a fresh FSM and
//! starts two tasks: an inbound pump that moves decoded channel events onto
//! the connection's event queue, and the worker that drains the queue,
//! feeds the FSM, and executes the resulting actions. The worker is the
//! only task that touches connection state; everything else communicates
//! through the queue.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, warn};

use idscp2_proto::codec;

use crate::channel::{ChannelEvent, SecureChannelHandle};
use crate::config::Idscp2Configuration;
use crate::error::Idscp2Error;
use crate::fsm::queue::EventQueue;
use crate::fsm::{Action, Event, Fsm, State};
use crate::rat::driver::DriverHandle;
use crate::timer::TimerService;

/// Coarse connection lifecycle, published to the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Handshake or (re-)attestation in progress; user payloads are
    /// rejected.
    Negotiating,
    /// Both attestation directions succeeded; user payloads flow.
    Established,
    /// Terminal.
    Closed,
}

/// User callbacks, invoked serially from the connection worker.
///
/// Implementations must not block; a panic inside a callback is caught and
/// logged without affecting the connection.
pub trait ConnectionListener: Send + Sync {
    fn on_message(&self, _payload: &[u8]) {}
    fn on_error(&self, _error: &Idscp2Error) {}
    fn on_closed(&self) {}
}

/// A listener that ignores everything.
pub struct NullConnectionListener;

impl ConnectionListener for NullConnectionListener {}

/// Handle to one IDSCP2 connection.
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct Idscp2Connection {
    events: Arc<EventQueue>,
    phase: watch::Receiver<ConnectionPhase>,
}

impl Idscp2Connection {
    /// Start a connection over an established secure channel. The FSM begins
    /// in its closed state and is kicked off with the synthetic start event,
    /// which emits HELLO.
    pub fn spawn(
        channel: SecureChannelHandle,
        config: Arc<Idscp2Configuration>,
        listener: Arc<dyn ConnectionListener>,
    ) -> Self {
        let events = Arc::new(EventQueue::new(config.event_queue_capacity));
        let (phase_tx, phase_rx) = watch::channel(ConnectionPhase::Negotiating);

        // Enqueued before the inbound pump starts, so the synthetic start is
        // processed ahead of any frame the peer has already sent.
        events.push(Event::Start);

        let fsm = Fsm::new(
            config.clone(),
            channel.local_certificate,
            channel.peer_certificate,
        );

        spawn_inbound_pump(channel.inbound, events.clone());

        let worker = Worker {
            fsm,
            events: events.clone(),
            timers: TimerService::new(events.clone()),
            outbound: Some(channel.outbound),
            prover: None,
            verifier: None,
            config,
            listener,
            phase: phase_tx,
        };
        tokio::spawn(worker.run());

        Self {
            events,
            phase: phase_rx,
        }
    }

    /// Submit a user payload. Non-blocking: the payload is enqueued for the
    /// worker. Fails immediately when the connection is not established —
    /// payloads are never queued across attestation.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), Idscp2Error> {
        match *self.phase.borrow() {
            ConnectionPhase::Established => {
                self.events.push(Event::UserSend(payload));
                Ok(())
            }
            ConnectionPhase::Negotiating => Err(Idscp2Error::NotEstablished),
            ConnectionPhase::Closed => Err(Idscp2Error::Closed),
        }
    }

    /// Demand a fresh attestation round from both sides.
    pub fn repeat_rat(&self) -> Result<(), Idscp2Error> {
        match *self.phase.borrow() {
            ConnectionPhase::Closed => Err(Idscp2Error::Closed),
            _ => {
                self.events.push(Event::UserRepeatRat);
                Ok(())
            }
        }
    }

    /// Close the connection gracefully. Idempotent.
    pub fn close(&self) {
        if *self.phase.borrow() != ConnectionPhase::Closed {
            self.events.push(Event::UserClose);
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    /// Watch phase changes.
    pub fn phase_watch(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase.clone()
    }

    /// Wait until the connection is established, or fail if it closes
    /// first.
    pub async fn wait_established(&self) -> Result<(), Idscp2Error> {
        let mut phase = self.phase.clone();
        loop {
            match *phase.borrow_and_update() {
                ConnectionPhase::Established => return Ok(()),
                ConnectionPhase::Closed => return Err(Idscp2Error::Closed),
                ConnectionPhase::Negotiating => {}
            }
            if phase.changed().await.is_err() {
                return Err(Idscp2Error::Closed);
            }
        }
    }

    /// Wait until the connection has closed.
    pub async fn wait_closed(&self) {
        let mut phase = self.phase.clone();
        loop {
            if *phase.borrow_and_update() == ConnectionPhase::Closed {
                return;
            }
            if phase.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Move decoded channel events onto the event queue, preserving wire order.
fn spawn_inbound_pump(mut inbound: mpsc::Receiver<ChannelEvent>, events: Arc<EventQueue>) {
    tokio::spawn(async move {
        while let Some(event) = inbound.recv().await {
            match event {
                ChannelEvent::Message(msg) => {
                    // The codec guarantees a decoded message carries a body.
                    if let Some(body) = msg.body {
                        events.push(Event::FromPeer(body));
                    }
                }
                ChannelEvent::Eof => {
                    events.push(Event::ChannelEof);
                    return;
                }
                ChannelEvent::Error(e) => {
                    events.push(Event::ChannelError(e));
                    return;
                }
            }
        }
    });
}

/// The single task that owns all connection state.
struct Worker {
    fsm: Fsm,
    events: Arc<EventQueue>,
    timers: TimerService,
    /// Present while the channel is writable; dropped on close.
    outbound: Option<mpsc::Sender<Vec<u8>>>,
    prover: Option<DriverHandle>,
    verifier: Option<DriverHandle>,
    config: Arc<Idscp2Configuration>,
    listener: Arc<dyn ConnectionListener>,
    phase: watch::Sender<ConnectionPhase>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let event = self.events.recv().await;

            // Fires of disarmed or re-armed timers settle here.
            if let Event::Timeout { kind, generation } = &event {
                if !self.timers.is_current(*kind, *generation) {
                    trace!(?kind, generation, "discarding stale timer fire");
                    continue;
                }
            }

            let actions = self.fsm.handle_event(event);
            for action in actions {
                self.execute(action).await;
            }
            self.publish_phase();

            if self.fsm.state() == State::Closed {
                break;
            }
        }
        debug!("connection worker finished");
    }

    fn publish_phase(&self) {
        let phase = match self.fsm.state() {
            State::Closed => ConnectionPhase::Closed,
            State::Established => ConnectionPhase::Established,
            _ => ConnectionPhase::Negotiating,
        };
        self.phase.send_if_modified(|current| {
            if *current != phase {
                *current = phase;
                true
            } else {
                false
            }
        });
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::SendMessage(msg) => {
                let Some(outbound) = &self.outbound else {
                    debug!("dropping outbound frame: channel already closed");
                    return;
                };
                match codec::encode_frame(&msg) {
                    Ok(frame) => {
                        if outbound.send(frame).await.is_err() {
                            debug!("dropping outbound frame: writer task gone");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode outbound frame"),
                }
            }
            Action::StartTimer { kind, duration } => self.timers.start(kind, duration),
            Action::CancelTimer(kind) => self.timers.cancel(kind),
            Action::CancelAllTimers => self.timers.cancel_all(),
            Action::StartProver { id, generation } => {
                if let Some(old) = self.prover.take() {
                    old.stop();
                }
                match self.config.registries.provers.start(
                    &id,
                    self.events.clone(),
                    generation,
                    self.config.driver_stop_grace,
                ) {
                    Some(handle) => self.prover = Some(handle),
                    None => self.events.push(Event::ProverFailed { generation }),
                }
            }
            Action::StartVerifier { id, generation } => {
                if let Some(old) = self.verifier.take() {
                    old.stop();
                }
                match self.config.registries.verifiers.start(
                    &id,
                    self.events.clone(),
                    generation,
                    self.config.driver_stop_grace,
                ) {
                    Some(handle) => self.verifier = Some(handle),
                    None => self.events.push(Event::VerifierFailed { generation }),
                }
            }
            Action::StopProver => {
                if let Some(handle) = self.prover.take() {
                    handle.stop();
                }
            }
            Action::StopVerifier => {
                if let Some(handle) = self.verifier.take() {
                    handle.stop();
                }
            }
            Action::DelegateToProver(data) => {
                if let Some(handle) = &self.prover {
                    handle.delegate(data);
                }
            }
            Action::DelegateToVerifier(data) => {
                if let Some(handle) = &self.verifier {
                    handle.delegate(data);
                }
            }
            Action::NotifyMessage(payload) => {
                self.with_listener(|l| l.on_message(&payload));
            }
            Action::NotifyError(err) => {
                self.with_listener(|l| l.on_error(&err));
            }
            Action::NotifyClosed => {
                self.with_listener(|l| l.on_closed());
            }
            Action::CloseChannel => {
                // Dropping the sender is the close signal for the writer
                // task; doing it twice is a no-op.
                self.outbound = None;
            }
        }
    }

    fn with_listener(&self, f: impl FnOnce(&dyn ConnectionListener)) {
        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(self.listener.as_ref())));
        if outcome.is_err() {
            error!("user callback panicked; connection state is unaffected");
        }
    }
}
