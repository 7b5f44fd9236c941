//! The per-connection finite state machine.
//!
//! The FSM is pure dispatch: [`Fsm::handle_event`] maps one event to the
//! next state plus a list of [`Action`]s, and the connection worker executes
//! those actions (send a frame, arm a timer, start a driver, run a user
//! callback). Keeping side effects out of the transition logic is what makes
//! the table testable without a transport or a runtime.
//!
//! Driver and timer events carry the generation counter they were issued
//! under; events from superseded drivers or disarmed timers are discarded
//! instead of being interpreted against newer state.

pub(crate) mod queue;

use std::sync::Arc;
use std::time::Duration;

use rustls_pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use idscp2_proto::wire::{self, Body, CloseCause, IdscpHello, IdscpMessage};

use crate::channel::ChannelError;
use crate::config::Idscp2Configuration;
use crate::error::Idscp2Error;
use crate::timer::TimerKind;

/// Connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    /// Initial and terminal state.
    Closed,
    /// HELLO sent, waiting for the peer's HELLO.
    WaitForHello,
    /// Prover and verifier running, neither side done.
    WaitForRat,
    /// Verifier ok, prover pending.
    WaitForRatProver,
    /// Prover ok, verifier pending.
    WaitForRatVerifier,
    /// Waiting for a fresh peer DAT, then a full RAT round.
    WaitForDatAndRat,
    /// Waiting for a fresh peer DAT, then re-verification only.
    WaitForDatAndRatVerifier,
    /// Attestation complete in both directions; user data may flow.
    Established,
}

/// Everything that can happen to a connection.
#[derive(Debug)]
pub(crate) enum Event {
    /// Synthetic kick-off, enqueued once when the connection is spawned.
    Start,
    /// A decoded wire message from the peer.
    FromPeer(Body),
    /// The peer half-closed the transport.
    ChannelEof,
    /// The transport failed.
    ChannelError(ChannelError),
    /// Outbound RAT message from the local prover driver.
    ProverMsg { generation: u64, data: Vec<u8> },
    ProverOk { generation: u64 },
    ProverFailed { generation: u64 },
    /// Outbound RAT message from the local verifier driver.
    VerifierMsg { generation: u64, data: Vec<u8> },
    VerifierOk { generation: u64 },
    VerifierFailed { generation: u64 },
    /// A named timer fired.
    Timeout { kind: TimerKind, generation: u64 },
    /// User payload submitted through the facade.
    UserSend(Vec<u8>),
    UserRepeatRat,
    UserClose,
}

impl Event {
    /// Timer events are the only droppable class under queue overflow.
    pub(crate) fn is_timer(&self) -> bool {
        matches!(self, Event::Timeout { .. })
    }
}

/// Commands the worker executes after a transition.
#[derive(Debug)]
pub(crate) enum Action {
    SendMessage(IdscpMessage),
    StartTimer { kind: TimerKind, duration: Duration },
    CancelTimer(TimerKind),
    CancelAllTimers,
    StartProver { id: String, generation: u64 },
    StartVerifier { id: String, generation: u64 },
    StopProver,
    StopVerifier,
    DelegateToProver(Vec<u8>),
    DelegateToVerifier(Vec<u8>),
    NotifyMessage(Vec<u8>),
    NotifyError(Idscp2Error),
    NotifyClosed,
    CloseChannel,
}

pub(crate) struct Fsm {
    state: State,
    config: Arc<Idscp2Configuration>,
    local_certificate: CertificateDer<'static>,
    peer_certificate: CertificateDer<'static>,
    /// RAT mechanism ids agreed during HELLO.
    chosen_prover: Option<String>,
    chosen_verifier: Option<String>,
    /// Generation counters distinguishing live driver handles from stale
    /// ones. Bumped on every start.
    prover_generation: u64,
    verifier_generation: u64,
    prover_active: bool,
    verifier_active: bool,
    /// Terminal outcomes of the current attestation round.
    rat_prover_done: bool,
    rat_verifier_done: bool,
    started: bool,
    closed_notified: bool,
}

impl Fsm {
    pub(crate) fn new(
        config: Arc<Idscp2Configuration>,
        local_certificate: CertificateDer<'static>,
        peer_certificate: CertificateDer<'static>,
    ) -> Self {
        Self {
            state: State::Closed,
            config,
            local_certificate,
            peer_certificate,
            chosen_prover: None,
            chosen_verifier: None,
            prover_generation: 0,
            verifier_generation: 0,
            prover_active: false,
            verifier_active: false,
            rat_prover_done: false,
            rat_verifier_done: false,
            started: false,
            closed_notified: false,
        }
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    /// Process one event. Transitions are atomic: the returned actions
    /// belong to exactly this event and must be executed before the next
    /// event is dequeued.
    pub(crate) fn handle_event(&mut self, event: Event) -> Vec<Action> {
        if self.state == State::Closed {
            return match event {
                Event::Start if !self.started => self.handle_start(),
                other => {
                    debug!(event = ?other, "event ignored in closed state");
                    Vec::new()
                }
            };
        }

        match event {
            Event::Start => Vec::new(),
            Event::FromPeer(body) => self.handle_wire(body),
            Event::ChannelEof => self.shutdown(
                None,
                Some(Idscp2Error::PeerClosed("transport closed".into())),
            ),
            Event::ChannelError(ChannelError::MalformedFrame(msg)) => self.shutdown(
                Some((CloseCause::Error, format!("malformed frame: {msg}"))),
                Some(Idscp2Error::MalformedFrame(msg)),
            ),
            Event::ChannelError(ChannelError::Transport(msg)) => {
                self.shutdown(None, Some(Idscp2Error::Tls(msg)))
            }
            Event::ProverMsg { generation, data } => {
                if self.prover_current(generation) {
                    vec![Action::SendMessage(wire::rat_prover(data))]
                } else {
                    debug!("dropping RAT message from stale prover");
                    Vec::new()
                }
            }
            Event::VerifierMsg { generation, data } => {
                if self.verifier_current(generation) {
                    vec![Action::SendMessage(wire::rat_verifier(data))]
                } else {
                    debug!("dropping RAT message from stale verifier");
                    Vec::new()
                }
            }
            Event::ProverOk { generation } => {
                if !self.prover_current(generation) {
                    debug!("ignoring OK from stale prover");
                    return Vec::new();
                }
                self.prover_active = false;
                self.rat_prover_done = true;
                let mut actions = vec![Action::StopProver];
                self.after_rat_progress(&mut actions);
                actions
            }
            Event::VerifierOk { generation } => {
                if !self.verifier_current(generation) {
                    debug!("ignoring OK from stale verifier");
                    return Vec::new();
                }
                self.verifier_active = false;
                self.rat_verifier_done = true;
                let mut actions = vec![Action::StopVerifier];
                self.after_rat_progress(&mut actions);
                actions
            }
            Event::ProverFailed { generation } => {
                if !self.prover_current(generation) {
                    debug!("ignoring failure from stale prover");
                    return Vec::new();
                }
                warn!("RAT prover failed");
                self.shutdown(
                    Some((CloseCause::RatProverFailed, "RAT prover failed".into())),
                    Some(Idscp2Error::RatFailed("prover failed".into())),
                )
            }
            Event::VerifierFailed { generation } => {
                if !self.verifier_current(generation) {
                    debug!("ignoring failure from stale verifier");
                    return Vec::new();
                }
                warn!("RAT verifier failed");
                self.shutdown(
                    Some((CloseCause::RatVerifierFailed, "RAT verifier failed".into())),
                    Some(Idscp2Error::RatFailed("verifier failed".into())),
                )
            }
            Event::Timeout { kind, .. } => self.handle_timeout(kind),
            Event::UserSend(payload) => {
                if self.state == State::Established {
                    vec![Action::SendMessage(wire::data(payload))]
                } else {
                    // The facade gates on the published phase; this is the
                    // lost race between snapshot and processing.
                    debug!("dropping user payload submitted outside the established state");
                    Vec::new()
                }
            }
            Event::UserRepeatRat => {
                if self.state == State::Established {
                    let mut actions =
                        vec![Action::SendMessage(wire::re_rat("re-attestation requested"))];
                    self.start_rat_round(&mut actions);
                    actions
                } else {
                    debug!("repeat_rat ignored: attestation already in progress");
                    Vec::new()
                }
            }
            Event::UserClose => self.shutdown(
                Some((CloseCause::UserShutdown, "connection closed by user".into())),
                None,
            ),
        }
    }

    // -- wire events --------------------------------------------------------

    fn handle_wire(&mut self, body: Body) -> Vec<Action> {
        match body {
            Body::Hello(hello) => {
                if self.state == State::WaitForHello {
                    self.handle_hello(hello)
                } else {
                    debug!(state = ?self.state, "unexpected HELLO ignored");
                    Vec::new()
                }
            }
            Body::Close(close) => {
                let cause = close.cause();
                debug!(?cause, msg = %close.cause_msg, "peer closed the connection");
                let error = if cause == CloseCause::UserShutdown {
                    None
                } else {
                    Some(Idscp2Error::PeerClosed(format!(
                        "{cause:?}: {}",
                        close.cause_msg
                    )))
                };
                self.shutdown(None, error)
            }
            Body::RatProver(msg) => {
                if self.verifier_active {
                    vec![Action::DelegateToVerifier(msg.data)]
                } else {
                    debug!("dropping peer RAT prover message: no live verifier");
                    Vec::new()
                }
            }
            Body::RatVerifier(msg) => {
                if self.prover_active {
                    vec![Action::DelegateToProver(msg.data)]
                } else {
                    debug!("dropping peer RAT verifier message: no live prover");
                    Vec::new()
                }
            }
            Body::ReRat(re_rat) => self.handle_re_rat(&re_rat.cause),
            Body::DatExpired(_) => self.handle_dat_expired(),
            Body::Dat(dat) => self.handle_dat(dat.token),
            Body::Data(data) => {
                if self.state == State::Established {
                    vec![Action::NotifyMessage(data.payload)]
                } else {
                    debug!(state = ?self.state, "dropping user data outside the established state");
                    Vec::new()
                }
            }
        }
    }

    fn handle_hello(&mut self, hello: IdscpHello) -> Vec<Action> {
        // The HELLO must be bound to the TLS identity we actually saw.
        let expected_hash = Sha256::digest(self.peer_certificate.as_ref());
        if hello.attestation_cert_hash.as_slice() != expected_hash.as_slice() {
            return self.shutdown(
                Some((
                    CloseCause::NoValidDat,
                    "attestation certificate hash does not match TLS certificate".into(),
                )),
                Some(Idscp2Error::DatInvalid(
                    "attestation certificate hash mismatch".into(),
                )),
            );
        }

        // Local preference order decides; my prover must be one the peer
        // can verify and vice versa.
        let prover = self
            .config
            .supported_rat_provers
            .iter()
            .find(|id| hello.supported_rat_verifiers.iter().any(|v| v == *id))
            .cloned();
        let verifier = self
            .config
            .supported_rat_verifiers
            .iter()
            .find(|id| hello.supported_rat_provers.iter().any(|p| p == *id))
            .cloned();

        let (Some(prover), Some(verifier)) = (prover, verifier) else {
            return self.shutdown(
                Some((
                    CloseCause::NoRatMechanism,
                    "no common RAT mechanism".into(),
                )),
                Some(Idscp2Error::NoMatchingRat(
                    "peer and local RAT mechanism lists have no overlap".into(),
                )),
            );
        };

        let token = hello.dat.map(|d| d.token).unwrap_or_default();
        match self.config.dat_verifier.verify(&token, &self.peer_certificate) {
            Ok(validity) => {
                debug!(%prover, %verifier, ?validity, "HELLO accepted");
                self.chosen_prover = Some(prover);
                self.chosen_verifier = Some(verifier);

                let mut actions = vec![
                    Action::CancelTimer(TimerKind::Handshake),
                    Action::StartTimer {
                        kind: TimerKind::Dat,
                        duration: validity,
                    },
                ];
                self.start_rat_round(&mut actions);
                actions
            }
            Err(e) => self.shutdown(
                Some((CloseCause::NoValidDat, format!("DAT rejected: {e}"))),
                Some(Idscp2Error::DatInvalid(e.to_string())),
            ),
        }
    }

    /// The peer demands fresh attestation evidence from us.
    ///
    /// Outside the established state only the prover restarts: the verifier
    /// tracks our own assessment of the peer, and the peer's demand does not
    /// invalidate that, so a running verifier keeps its round and a finished
    /// one keeps its verdict. The full pair restarts only from the
    /// established state, where re-attestation is mutual by construction
    /// (the initiating side sent RE_RAT alongside restarting its own pair).
    /// In the DAT-waiting states the verifier is already stopped until the
    /// fresh peer DAT arrives, so the prover restart is the only live
    /// action. Leaving the `*Verifier` variants records that the prover
    /// verdict is void again.
    fn handle_re_rat(&mut self, cause: &str) -> Vec<Action> {
        debug!(%cause, state = ?self.state, "peer requested re-attestation");
        let mut actions = Vec::new();
        match self.state {
            State::Established => {
                self.start_rat_round(&mut actions);
            }
            State::WaitForRat | State::WaitForRatProver | State::WaitForDatAndRat => {
                self.start_prover(&mut actions);
            }
            State::WaitForRatVerifier => {
                self.start_prover(&mut actions);
                self.state = State::WaitForRat;
            }
            State::WaitForDatAndRatVerifier => {
                self.start_prover(&mut actions);
                self.state = State::WaitForDatAndRat;
            }
            State::WaitForHello | State::Closed => {}
        }
        actions
    }

    /// The peer considers our DAT expired: ship a fresh token and re-prove.
    fn handle_dat_expired(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.state {
            State::Established => {
                if !self.renew_local_dat(&mut actions) {
                    return actions;
                }
                actions.push(Action::StartTimer {
                    kind: TimerKind::Rat,
                    duration: self.config.rat_timeout,
                });
                self.state = State::WaitForRatProver;
            }
            State::WaitForRat | State::WaitForRatProver | State::WaitForDatAndRat => {
                self.renew_local_dat(&mut actions);
            }
            State::WaitForRatVerifier => {
                if self.renew_local_dat(&mut actions) {
                    self.state = State::WaitForRat;
                }
            }
            State::WaitForDatAndRatVerifier => {
                if self.renew_local_dat(&mut actions) {
                    self.state = State::WaitForDatAndRat;
                }
            }
            State::WaitForHello | State::Closed => {
                debug!("DAT_EXPIRED ignored before handshake completion");
            }
        }
        actions
    }

    /// A fresh peer DAT arrived after we demanded one.
    fn handle_dat(&mut self, token: Vec<u8>) -> Vec<Action> {
        match self.state {
            State::WaitForDatAndRat | State::WaitForDatAndRatVerifier => {
                match self.config.dat_verifier.verify(&token, &self.peer_certificate) {
                    Ok(validity) => {
                        let mut actions = vec![Action::StartTimer {
                            kind: TimerKind::Dat,
                            duration: validity,
                        }];
                        self.start_verifier(&mut actions);
                        self.state = if self.rat_prover_done {
                            State::WaitForRatVerifier
                        } else {
                            State::WaitForRat
                        };
                        actions
                    }
                    Err(e) => self.shutdown(
                        Some((CloseCause::NoValidDat, format!("DAT rejected: {e}"))),
                        Some(Idscp2Error::DatInvalid(e.to_string())),
                    ),
                }
            }
            _ => {
                debug!(state = ?self.state, "unsolicited DAT ignored");
                Vec::new()
            }
        }
    }

    // -- timers -------------------------------------------------------------

    fn handle_timeout(&mut self, kind: TimerKind) -> Vec<Action> {
        match (kind, self.state) {
            (TimerKind::Handshake, State::WaitForHello) => self.shutdown(
                Some((CloseCause::Timeout, "handshake timed out".into())),
                Some(Idscp2Error::HandshakeTimeout),
            ),
            // The peer's DAT ran out while established: demand a fresh one
            // and re-verify once it arrives.
            (TimerKind::Dat, State::Established) => {
                self.rat_verifier_done = false;
                self.state = State::WaitForDatAndRatVerifier;
                vec![
                    Action::SendMessage(wire::dat_expired()),
                    // Replaces the refresh arming with the round watchdog,
                    // which also invalidates a refresh fire racing with
                    // this expiry: DAT renewal implies re-attestation.
                    Action::StartTimer {
                        kind: TimerKind::Rat,
                        duration: self.config.rat_timeout,
                    },
                ]
            }
            // The peer's DAT ran out mid-attestation: the verifier verdict
            // would be meaningless, stop it until the fresh DAT arrives.
            (
                TimerKind::Dat,
                State::WaitForRat | State::WaitForRatProver | State::WaitForRatVerifier,
            ) => {
                let mut actions = vec![Action::SendMessage(wire::dat_expired())];
                if self.verifier_active {
                    actions.push(Action::StopVerifier);
                    self.verifier_active = false;
                }
                self.rat_verifier_done = false;
                self.state = if self.rat_prover_done {
                    State::WaitForDatAndRatVerifier
                } else {
                    State::WaitForDatAndRat
                };
                actions
            }
            (TimerKind::Rat, State::Established) => {
                let mut actions = vec![Action::SendMessage(wire::re_rat("periodic refresh"))];
                self.start_rat_round(&mut actions);
                actions
            }
            (
                TimerKind::Rat,
                State::WaitForRat
                | State::WaitForRatProver
                | State::WaitForRatVerifier
                | State::WaitForDatAndRat
                | State::WaitForDatAndRatVerifier,
            ) => self.shutdown(
                Some((CloseCause::Timeout, "attestation timed out".into())),
                Some(Idscp2Error::RatFailed("attestation timed out".into())),
            ),
            (kind, state) => {
                debug!(?kind, ?state, "stale timer fire ignored");
                Vec::new()
            }
        }
    }

    // -- entry/exit helpers -------------------------------------------------

    fn handle_start(&mut self) -> Vec<Action> {
        self.started = true;
        match self.config.dat_provider.token() {
            Ok(dat) => {
                let hash = Sha256::digest(self.local_certificate.as_ref()).to_vec();
                self.state = State::WaitForHello;
                vec![
                    Action::SendMessage(wire::hello(
                        dat.token,
                        self.config.supported_rat_provers.clone(),
                        self.config.supported_rat_verifiers.clone(),
                        hash,
                    )),
                    Action::StartTimer {
                        kind: TimerKind::Handshake,
                        duration: self.config.handshake_timeout,
                    },
                ]
            }
            Err(e) => self.shutdown(
                Some((CloseCause::Error, "local DAT unavailable".into())),
                Some(Idscp2Error::DatInvalid(format!("local DAT unavailable: {e}"))),
            ),
        }
    }

    /// Start a full prover+verifier round and arm the round watchdog.
    fn start_rat_round(&mut self, actions: &mut Vec<Action>) {
        self.start_prover(actions);
        self.start_verifier(actions);
        actions.push(Action::StartTimer {
            kind: TimerKind::Rat,
            duration: self.config.rat_timeout,
        });
        self.state = State::WaitForRat;
    }

    fn start_prover(&mut self, actions: &mut Vec<Action>) {
        // The chosen ids are fixed in the HELLO handler before any caller
        // of this method can run.
        if let Some(id) = self.chosen_prover.clone() {
            if self.prover_active {
                actions.push(Action::StopProver);
            }
            self.prover_generation += 1;
            self.prover_active = true;
            self.rat_prover_done = false;
            actions.push(Action::StartProver {
                id,
                generation: self.prover_generation,
            });
        }
    }

    fn start_verifier(&mut self, actions: &mut Vec<Action>) {
        if let Some(id) = self.chosen_verifier.clone() {
            if self.verifier_active {
                actions.push(Action::StopVerifier);
            }
            self.verifier_generation += 1;
            self.verifier_active = true;
            self.rat_verifier_done = false;
            actions.push(Action::StartVerifier {
                id,
                generation: self.verifier_generation,
            });
        }
    }

    /// Fetch a fresh local DAT and restart the prover so the peer can
    /// re-verify us against it. Returns false if the provider failed and the
    /// connection is shutting down.
    fn renew_local_dat(&mut self, actions: &mut Vec<Action>) -> bool {
        match self.config.dat_provider.token() {
            Ok(dat) => {
                actions.push(Action::SendMessage(wire::dat(dat.token)));
                self.start_prover(actions);
                true
            }
            Err(e) => {
                actions.extend(self.shutdown(
                    Some((CloseCause::Error, "local DAT unavailable".into())),
                    Some(Idscp2Error::DatInvalid(format!(
                        "local DAT unavailable: {e}"
                    ))),
                ));
                false
            }
        }
    }

    /// Advance out of the attestation states once a side reports OK.
    fn after_rat_progress(&mut self, actions: &mut Vec<Action>) {
        match self.state {
            State::WaitForRat | State::WaitForRatProver | State::WaitForRatVerifier => {
                if self.rat_prover_done && self.rat_verifier_done {
                    self.enter_established(actions);
                } else if self.rat_prover_done {
                    self.state = State::WaitForRatVerifier;
                } else if self.rat_verifier_done {
                    self.state = State::WaitForRatProver;
                }
            }
            // Progress while a fresh peer DAT is outstanding does not leave
            // the waiting states.
            State::WaitForDatAndRat | State::WaitForDatAndRatVerifier => {}
            State::WaitForHello | State::Established | State::Closed => {}
        }
    }

    fn enter_established(&mut self, actions: &mut Vec<Action>) {
        self.prover_active = false;
        self.verifier_active = false;
        actions.push(Action::StopProver);
        actions.push(Action::StopVerifier);
        actions.push(Action::StartTimer {
            kind: TimerKind::Rat,
            duration: self.config.rat_refresh_interval,
        });
        self.state = State::Established;
    }

    /// Unified teardown. `send_close` carries the CLOSE frame to emit while
    /// the channel is still writable; it is `None` when the peer or the
    /// transport initiated the close.
    fn shutdown(
        &mut self,
        send_close: Option<(CloseCause, String)>,
        error: Option<Idscp2Error>,
    ) -> Vec<Action> {
        let mut actions = vec![
            Action::CancelAllTimers,
            Action::StopProver,
            Action::StopVerifier,
        ];
        self.prover_active = false;
        self.verifier_active = false;

        if let Some((cause, msg)) = send_close {
            actions.push(Action::SendMessage(wire::close(cause, &msg)));
        }
        if let Some(error) = error {
            actions.push(Action::NotifyError(error));
        }
        actions.push(Action::CloseChannel);
        if !self.closed_notified {
            self.closed_notified = true;
            actions.push(Action::NotifyClosed);
        }
        self.state = State::Closed;
        actions
    }

    fn prover_current(&self, generation: u64) -> bool {
        self.prover_active && generation == self.prover_generation
    }

    fn verifier_current(&self, generation: u64) -> bool {
        self.verifier_active && generation == self.verifier_generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dat::{AcceptAllDatVerifier, StaticDatProvider};

    fn test_config() -> Arc<Idscp2Configuration> {
        Arc::new(Idscp2Configuration::new(
            Arc::new(StaticDatProvider::new(b"local-token".to_vec(), Duration::from_secs(60))),
            Arc::new(AcceptAllDatVerifier::new(Duration::from_secs(60))),
        ))
    }

    fn test_fsm() -> Fsm {
        Fsm::new(
            test_config(),
            CertificateDer::from(b"local-cert".to_vec()),
            CertificateDer::from(b"peer-cert".to_vec()),
        )
    }

    /// A HELLO as the peer at `peer-cert` would send it.
    fn peer_hello(provers: &[&str], verifiers: &[&str]) -> Body {
        let hash = Sha256::digest(b"peer-cert").to_vec();
        let msg = wire::hello(
            b"peer-token".to_vec(),
            provers.iter().map(|s| s.to_string()).collect(),
            verifiers.iter().map(|s| s.to_string()).collect(),
            hash,
        );
        msg.body.unwrap()
    }

    fn start(fsm: &mut Fsm) -> Vec<Action> {
        let actions = fsm.handle_event(Event::Start);
        assert_eq!(fsm.state(), State::WaitForHello);
        actions
    }

    fn establish(fsm: &mut Fsm) {
        start(fsm);
        fsm.handle_event(Event::FromPeer(peer_hello(&["Dummy"], &["Dummy"])));
        assert_eq!(fsm.state(), State::WaitForRat);
        fsm.handle_event(Event::ProverOk { generation: fsm.prover_generation });
        fsm.handle_event(Event::VerifierOk { generation: fsm.verifier_generation });
        assert_eq!(fsm.state(), State::Established);
    }

    fn has_close_frame(actions: &[Action], cause: CloseCause) -> bool {
        actions.iter().any(|a| match a {
            Action::SendMessage(m) => matches!(
                &m.body,
                Some(Body::Close(c)) if c.cause() == cause
            ),
            _ => false,
        })
    }

    #[test]
    fn start_emits_hello_and_handshake_timer() {
        let mut fsm = test_fsm();
        let actions = start(&mut fsm);

        let hello = actions.iter().find_map(|a| match a {
            Action::SendMessage(m) => match &m.body {
                Some(Body::Hello(h)) => Some(h.clone()),
                _ => None,
            },
            _ => None,
        });
        let hello = hello.expect("START must emit HELLO");
        assert_eq!(hello.dat.unwrap().token, b"local-token");
        assert_eq!(
            hello.attestation_cert_hash,
            Sha256::digest(b"local-cert").to_vec()
        );
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::StartTimer { kind: TimerKind::Handshake, .. }
        )));
    }

    #[test]
    fn hello_starts_both_drivers_and_dat_timer() {
        let mut fsm = test_fsm();
        start(&mut fsm);

        let actions = fsm.handle_event(Event::FromPeer(peer_hello(&["Dummy"], &["Dummy"])));
        assert_eq!(fsm.state(), State::WaitForRat);
        assert!(actions.iter().any(|a| matches!(a, Action::StartProver { .. })));
        assert!(actions.iter().any(|a| matches!(a, Action::StartVerifier { .. })));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::CancelTimer(TimerKind::Handshake))));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::StartTimer { kind: TimerKind::Dat, .. })));
    }

    #[test]
    fn no_matching_rat_closes_with_cause() {
        let mut fsm = test_fsm();
        start(&mut fsm);

        let actions = fsm.handle_event(Event::FromPeer(peer_hello(&["TPM2d"], &["TPM2d"])));
        assert_eq!(fsm.state(), State::Closed);
        assert!(has_close_frame(&actions, CloseCause::NoRatMechanism));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::NotifyError(Idscp2Error::NoMatchingRat(_)))));
        assert!(actions.iter().any(|a| matches!(a, Action::NotifyClosed)));
    }

    #[test]
    fn local_preference_breaks_ties() {
        let mut fsm = test_fsm();
        {
            let config = Arc::get_mut(&mut fsm.config).unwrap();
            config.supported_rat_provers = vec!["A".into(), "B".into()];
            config.supported_rat_verifiers = vec!["B".into(), "A".into()];
        }
        start(&mut fsm);
        // Peer supports both, in opposite preference order.
        fsm.handle_event(Event::FromPeer(peer_hello(&["B", "A"], &["B", "A"])));

        assert_eq!(fsm.chosen_prover.as_deref(), Some("A"));
        assert_eq!(fsm.chosen_verifier.as_deref(), Some("B"));
    }

    #[test]
    fn cert_hash_mismatch_is_fatal() {
        let mut fsm = test_fsm();
        start(&mut fsm);

        let msg = wire::hello(
            b"peer-token".to_vec(),
            vec!["Dummy".into()],
            vec!["Dummy".into()],
            vec![0u8; 32], // wrong hash
        );
        let Some(body) = msg.body else { unreachable!() };
        let actions = fsm.handle_event(Event::FromPeer(body));

        assert_eq!(fsm.state(), State::Closed);
        assert!(has_close_frame(&actions, CloseCause::NoValidDat));
    }

    #[test]
    fn prover_then_verifier_ok_reaches_established() {
        let mut fsm = test_fsm();
        start(&mut fsm);
        fsm.handle_event(Event::FromPeer(peer_hello(&["Dummy"], &["Dummy"])));

        fsm.handle_event(Event::ProverOk { generation: fsm.prover_generation });
        assert_eq!(fsm.state(), State::WaitForRatVerifier);

        let actions =
            fsm.handle_event(Event::VerifierOk { generation: fsm.verifier_generation });
        assert_eq!(fsm.state(), State::Established);
        // Refresh interval armed on entry.
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::StartTimer { kind: TimerKind::Rat, .. })));
    }

    #[test]
    fn verifier_then_prover_ok_reaches_established() {
        let mut fsm = test_fsm();
        start(&mut fsm);
        fsm.handle_event(Event::FromPeer(peer_hello(&["Dummy"], &["Dummy"])));

        fsm.handle_event(Event::VerifierOk { generation: fsm.verifier_generation });
        assert_eq!(fsm.state(), State::WaitForRatProver);

        fsm.handle_event(Event::ProverOk { generation: fsm.prover_generation });
        assert_eq!(fsm.state(), State::Established);
    }

    #[test]
    fn stale_driver_events_are_discarded() {
        let mut fsm = test_fsm();
        start(&mut fsm);
        fsm.handle_event(Event::FromPeer(peer_hello(&["Dummy"], &["Dummy"])));

        let generation = fsm.prover_generation;
        fsm.handle_event(Event::ProverOk { generation });
        // A duplicate OK from the now-stopped prover changes nothing.
        let actions = fsm.handle_event(Event::ProverOk { generation });
        assert!(actions.is_empty());
        assert_eq!(fsm.state(), State::WaitForRatVerifier);

        // A failure from the stopped prover must not kill the connection.
        let actions = fsm.handle_event(Event::ProverFailed { generation });
        assert!(actions.is_empty());
        assert_ne!(fsm.state(), State::Closed);
    }

    #[test]
    fn prover_failure_closes_with_rat_failed() {
        let mut fsm = test_fsm();
        start(&mut fsm);
        fsm.handle_event(Event::FromPeer(peer_hello(&["Dummy"], &["Dummy"])));

        let actions =
            fsm.handle_event(Event::ProverFailed { generation: fsm.prover_generation });
        assert_eq!(fsm.state(), State::Closed);
        assert!(has_close_frame(&actions, CloseCause::RatProverFailed));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::NotifyError(Idscp2Error::RatFailed(_)))));
    }

    #[test]
    fn rat_messages_are_bridged_between_peer_and_drivers() {
        let mut fsm = test_fsm();
        start(&mut fsm);
        fsm.handle_event(Event::FromPeer(peer_hello(&["Dummy"], &["Dummy"])));

        // Peer prover evidence goes to the local verifier.
        let actions = fsm.handle_event(Event::FromPeer(Body::RatProver(
            wire::IdscpRatProver { data: b"evidence".to_vec() },
        )));
        assert!(matches!(
            actions.as_slice(),
            [Action::DelegateToVerifier(data)] if data == b"evidence"
        ));

        // Local prover output goes on the wire as RAT_PROVER.
        let actions = fsm.handle_event(Event::ProverMsg {
            generation: fsm.prover_generation,
            data: b"report".to_vec(),
        });
        assert!(matches!(
            actions.as_slice(),
            [Action::SendMessage(m)] if matches!(&m.body, Some(Body::RatProver(p)) if p.data == b"report")
        ));
    }

    #[test]
    fn handshake_timeout_closes() {
        let mut fsm = test_fsm();
        start(&mut fsm);

        let actions = fsm.handle_event(Event::Timeout {
            kind: TimerKind::Handshake,
            generation: 1,
        });
        assert_eq!(fsm.state(), State::Closed);
        assert!(has_close_frame(&actions, CloseCause::Timeout));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::NotifyError(Idscp2Error::HandshakeTimeout))));
    }

    #[test]
    fn established_data_flows_both_ways() {
        let mut fsm = test_fsm();
        establish(&mut fsm);

        let actions = fsm.handle_event(Event::UserSend(b"ping".to_vec()));
        assert!(matches!(
            actions.as_slice(),
            [Action::SendMessage(m)] if matches!(&m.body, Some(Body::Data(d)) if d.payload == b"ping")
        ));

        let actions = fsm.handle_event(Event::FromPeer(Body::Data(wire::IdscpData {
            payload: b"pong".to_vec(),
        })));
        assert!(matches!(
            actions.as_slice(),
            [Action::NotifyMessage(p)] if p == b"pong"
        ));
    }

    #[test]
    fn data_is_not_delivered_outside_established() {
        let mut fsm = test_fsm();
        start(&mut fsm);
        fsm.handle_event(Event::FromPeer(peer_hello(&["Dummy"], &["Dummy"])));

        let actions = fsm.handle_event(Event::FromPeer(Body::Data(wire::IdscpData {
            payload: b"early".to_vec(),
        })));
        assert!(actions.is_empty());
    }

    #[test]
    fn rat_refresh_restarts_both_drivers() {
        let mut fsm = test_fsm();
        establish(&mut fsm);

        let actions = fsm.handle_event(Event::Timeout {
            kind: TimerKind::Rat,
            generation: 2,
        });
        assert_eq!(fsm.state(), State::WaitForRat);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SendMessage(m) if matches!(&m.body, Some(Body::ReRat(_)))
        )));
        assert!(actions.iter().any(|a| matches!(a, Action::StartProver { .. })));
        assert!(actions.iter().any(|a| matches!(a, Action::StartVerifier { .. })));

        // Completing the round re-enters Established.
        fsm.handle_event(Event::ProverOk { generation: fsm.prover_generation });
        fsm.handle_event(Event::VerifierOk { generation: fsm.verifier_generation });
        assert_eq!(fsm.state(), State::Established);
    }

    #[test]
    fn peer_re_rat_restarts_round_without_echo() {
        let mut fsm = test_fsm();
        establish(&mut fsm);

        let actions = fsm.handle_event(Event::FromPeer(Body::ReRat(wire::IdscpReRat {
            cause: "suspicion".into(),
        })));
        assert_eq!(fsm.state(), State::WaitForRat);
        // No RE_RAT may be sent back, or both sides would loop forever.
        assert!(!actions.iter().any(|a| matches!(
            a,
            Action::SendMessage(m) if matches!(&m.body, Some(Body::ReRat(_)))
        )));
    }

    fn restarts_prover(actions: &[Action]) -> bool {
        actions.iter().any(|a| matches!(a, Action::StartProver { .. }))
    }

    fn restarts_verifier(actions: &[Action]) -> bool {
        actions.iter().any(|a| matches!(a, Action::StartVerifier { .. }))
    }

    fn peer_re_rat() -> Body {
        Body::ReRat(wire::IdscpReRat {
            cause: "prove yourself again".into(),
        })
    }

    #[test]
    fn re_rat_mid_round_restarts_prover_and_keeps_running_verifier() {
        let mut fsm = test_fsm();
        start(&mut fsm);
        fsm.handle_event(Event::FromPeer(peer_hello(&["Dummy"], &["Dummy"])));
        assert_eq!(fsm.state(), State::WaitForRat);
        let verifier_generation = fsm.verifier_generation;

        let actions = fsm.handle_event(Event::FromPeer(peer_re_rat()));
        assert_eq!(fsm.state(), State::WaitForRat);
        assert!(restarts_prover(&actions));
        assert!(!restarts_verifier(&actions));
        // The running verifier is untouched; its round still counts.
        assert_eq!(fsm.verifier_generation, verifier_generation);

        fsm.handle_event(Event::VerifierOk { generation: verifier_generation });
        assert_eq!(fsm.state(), State::WaitForRatProver);
        fsm.handle_event(Event::ProverOk { generation: fsm.prover_generation });
        assert_eq!(fsm.state(), State::Established);
    }

    #[test]
    fn re_rat_keeps_a_finished_verifier_verdict() {
        let mut fsm = test_fsm();
        start(&mut fsm);
        fsm.handle_event(Event::FromPeer(peer_hello(&["Dummy"], &["Dummy"])));
        fsm.handle_event(Event::VerifierOk { generation: fsm.verifier_generation });
        assert_eq!(fsm.state(), State::WaitForRatProver);

        let actions = fsm.handle_event(Event::FromPeer(peer_re_rat()));
        assert_eq!(fsm.state(), State::WaitForRatProver);
        assert!(restarts_prover(&actions));
        assert!(!restarts_verifier(&actions));

        // Only the restarted prover is owed; its OK completes the round.
        fsm.handle_event(Event::ProverOk { generation: fsm.prover_generation });
        assert_eq!(fsm.state(), State::Established);
    }

    #[test]
    fn re_rat_voids_a_finished_prover_round() {
        let mut fsm = test_fsm();
        start(&mut fsm);
        fsm.handle_event(Event::FromPeer(peer_hello(&["Dummy"], &["Dummy"])));
        fsm.handle_event(Event::ProverOk { generation: fsm.prover_generation });
        assert_eq!(fsm.state(), State::WaitForRatVerifier);
        let verifier_generation = fsm.verifier_generation;

        let actions = fsm.handle_event(Event::FromPeer(peer_re_rat()));
        // The prover verdict is void again, the verifier round survives.
        assert_eq!(fsm.state(), State::WaitForRat);
        assert!(restarts_prover(&actions));
        assert!(!restarts_verifier(&actions));
        assert_eq!(fsm.verifier_generation, verifier_generation);

        fsm.handle_event(Event::VerifierOk { generation: verifier_generation });
        assert_eq!(fsm.state(), State::WaitForRatProver);
        fsm.handle_event(Event::ProverOk { generation: fsm.prover_generation });
        assert_eq!(fsm.state(), State::Established);
    }

    #[test]
    fn re_rat_while_awaiting_peer_dat_starts_no_verifier() {
        let mut fsm = test_fsm();
        start(&mut fsm);
        fsm.handle_event(Event::FromPeer(peer_hello(&["Dummy"], &["Dummy"])));
        fsm.handle_event(Event::Timeout { kind: TimerKind::Dat, generation: 1 });
        assert_eq!(fsm.state(), State::WaitForDatAndRat);

        let actions = fsm.handle_event(Event::FromPeer(peer_re_rat()));
        assert_eq!(fsm.state(), State::WaitForDatAndRat);
        assert!(restarts_prover(&actions));
        // The verifier stays down until the fresh peer DAT arrives.
        assert!(!restarts_verifier(&actions));
        assert!(!fsm.verifier_active);

        let actions = fsm.handle_event(Event::FromPeer(Body::Dat(wire::IdscpDat {
            token: b"fresh".to_vec(),
        })));
        assert_eq!(fsm.state(), State::WaitForRat);
        assert!(restarts_verifier(&actions));
    }

    #[test]
    fn re_rat_after_dat_expiry_reopens_the_prover_round() {
        let mut fsm = test_fsm();
        establish(&mut fsm);
        fsm.handle_event(Event::Timeout { kind: TimerKind::Dat, generation: 1 });
        assert_eq!(fsm.state(), State::WaitForDatAndRatVerifier);

        let actions = fsm.handle_event(Event::FromPeer(peer_re_rat()));
        assert_eq!(fsm.state(), State::WaitForDatAndRat);
        assert!(restarts_prover(&actions));
        assert!(!restarts_verifier(&actions));

        // Once the fresh DAT lands, both rounds are owed again.
        let actions = fsm.handle_event(Event::FromPeer(Body::Dat(wire::IdscpDat {
            token: b"fresh".to_vec(),
        })));
        assert_eq!(fsm.state(), State::WaitForRat);
        assert!(restarts_verifier(&actions));

        fsm.handle_event(Event::ProverOk { generation: fsm.prover_generation });
        fsm.handle_event(Event::VerifierOk { generation: fsm.verifier_generation });
        assert_eq!(fsm.state(), State::Established);
    }

    #[test]
    fn dat_timer_expiry_demands_fresh_dat_and_reverifies() {
        let mut fsm = test_fsm();
        establish(&mut fsm);

        let actions = fsm.handle_event(Event::Timeout {
            kind: TimerKind::Dat,
            generation: 1,
        });
        assert_eq!(fsm.state(), State::WaitForDatAndRatVerifier);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SendMessage(m) if matches!(&m.body, Some(Body::DatExpired(_)))
        )));

        // Fresh peer DAT arrives: verifier restarts, prover verdict holds.
        let actions = fsm.handle_event(Event::FromPeer(Body::Dat(wire::IdscpDat {
            token: b"fresh".to_vec(),
        })));
        assert_eq!(fsm.state(), State::WaitForRatVerifier);
        assert!(actions.iter().any(|a| matches!(a, Action::StartVerifier { .. })));

        fsm.handle_event(Event::VerifierOk { generation: fsm.verifier_generation });
        assert_eq!(fsm.state(), State::Established);
    }

    #[test]
    fn dat_expired_received_renews_token_and_reproves() {
        let mut fsm = test_fsm();
        establish(&mut fsm);

        let actions = fsm.handle_event(Event::FromPeer(Body::DatExpired(
            wire::IdscpDatExpired {},
        )));
        assert_eq!(fsm.state(), State::WaitForRatProver);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SendMessage(m) if matches!(&m.body, Some(Body::Dat(d)) if d.token == b"local-token")
        )));
        assert!(actions.iter().any(|a| matches!(a, Action::StartProver { .. })));

        fsm.handle_event(Event::ProverOk { generation: fsm.prover_generation });
        assert_eq!(fsm.state(), State::Established);
    }

    #[test]
    fn invalid_renewed_dat_closes() {
        let mut fsm = test_fsm();
        establish(&mut fsm);
        fsm.handle_event(Event::Timeout { kind: TimerKind::Dat, generation: 1 });

        // Swap in a rejecting verifier for the renewal.
        struct RejectAll;
        impl crate::dat::DatVerifier for RejectAll {
            fn verify(
                &self,
                _token: &[u8],
                _cert: &CertificateDer<'_>,
            ) -> Result<Duration, crate::dat::DatError> {
                Err(crate::dat::DatError::new("expired issuer"))
            }
        }
        Arc::get_mut(&mut fsm.config).unwrap().dat_verifier = Arc::new(RejectAll);

        let actions = fsm.handle_event(Event::FromPeer(Body::Dat(wire::IdscpDat {
            token: b"bad".to_vec(),
        })));
        assert_eq!(fsm.state(), State::Closed);
        assert!(has_close_frame(&actions, CloseCause::NoValidDat));
    }

    #[test]
    fn peer_close_wins_and_notifies_once() {
        let mut fsm = test_fsm();
        establish(&mut fsm);

        let close = wire::close(CloseCause::UserShutdown, "bye");
        let Some(body) = close.body else { unreachable!() };
        let actions = fsm.handle_event(Event::FromPeer(body));
        assert_eq!(fsm.state(), State::Closed);
        // Graceful peer close: no error, exactly one NotifyClosed, and no
        // CLOSE frame echoed back.
        assert!(!actions.iter().any(|a| matches!(a, Action::NotifyError(_))));
        assert_eq!(
            actions.iter().filter(|a| matches!(a, Action::NotifyClosed)).count(),
            1
        );
        assert!(!actions.iter().any(|a| matches!(a, Action::SendMessage(_))));

        // Terminal: further events are ignored, on_closed never fires again.
        let actions = fsm.handle_event(Event::UserClose);
        assert!(actions.is_empty());
        let actions = fsm.handle_event(Event::Start);
        assert!(actions.is_empty());
    }

    #[test]
    fn attestation_watchdog_expiry_closes() {
        let mut fsm = test_fsm();
        start(&mut fsm);
        fsm.handle_event(Event::FromPeer(peer_hello(&["Dummy"], &["Dummy"])));

        let actions = fsm.handle_event(Event::Timeout {
            kind: TimerKind::Rat,
            generation: 1,
        });
        assert_eq!(fsm.state(), State::Closed);
        assert!(has_close_frame(&actions, CloseCause::Timeout));
    }

    #[test]
    fn shutdown_stops_drivers_and_cancels_timers() {
        let mut fsm = test_fsm();
        start(&mut fsm);
        fsm.handle_event(Event::FromPeer(peer_hello(&["Dummy"], &["Dummy"])));

        let actions = fsm.handle_event(Event::UserClose);
        assert_eq!(fsm.state(), State::Closed);
        assert!(actions.iter().any(|a| matches!(a, Action::CancelAllTimers)));
        assert!(actions.iter().any(|a| matches!(a, Action::StopProver)));
        assert!(actions.iter().any(|a| matches!(a, Action::StopVerifier)));
        assert!(has_close_frame(&actions, CloseCause::UserShutdown));
        // The CLOSE frame must precede the channel teardown.
        let close_pos = actions
            .iter()
            .position(|a| matches!(a, Action::SendMessage(_)))
            .unwrap();
        let chan_pos = actions
            .iter()
            .position(|a| matches!(a, Action::CloseChannel))
            .unwrap();
        assert!(close_pos < chan_pos);
    }

    #[test]
    fn eof_closes_without_emitting_frames() {
        let mut fsm = test_fsm();
        establish(&mut fsm);

        let actions = fsm.handle_event(Event::ChannelEof);
        assert_eq!(fsm.state(), State::Closed);
        assert!(!actions.iter().any(|a| matches!(a, Action::SendMessage(_))));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::NotifyError(Idscp2Error::PeerClosed(_)))));
    }

    #[test]
    fn malformed_frame_is_fatal() {
        let mut fsm = test_fsm();
        establish(&mut fsm);

        let actions = fsm.handle_event(Event::ChannelError(ChannelError::MalformedFrame(
            "frame of 4294967295 bytes exceeds the 4194304-byte limit".into(),
        )));
        assert_eq!(fsm.state(), State::Closed);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::NotifyError(Idscp2Error::MalformedFrame(_)))));
    }
}
