//! The driver contract and its runtime.
//!
//! A driver is a long-running task that talks only to the FSM: it receives
//! peer RAT messages through its context's delegate queue and emits outbound
//! messages plus one terminal verdict. The runtime wraps each driver in a
//! tokio task whose completion becomes the `*_OK` / `*_FAILED` event, tagged
//! with the generation the handle was started under so the FSM can discard
//! anything a superseded driver still produces.
//!
//! Stopping is cooperative: the delegate queue closes (`recv` returns
//! `None`) and the driver is expected to return promptly. A watchdog aborts
//! the task after the configured grace period.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::fsm::queue::EventQueue;
use crate::fsm::Event;

/// Failure reported by a driver, either from its factory at start or from
/// `run`.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct RatDriverError(pub String);

impl RatDriverError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Produces attestation evidence for the remote verifier.
///
/// `run` drives one attestation round: exchange messages via the context,
/// then return `Ok` for success or `Err` for failure. Returning promptly
/// after [`RatProverContext::recv`] yields `None` is part of the contract.
#[async_trait]
pub trait RatProverDriver: Send {
    async fn run(&mut self, ctx: &mut RatProverContext) -> Result<(), RatDriverError>;
}

/// Evaluates the remote prover's attestation evidence.
#[async_trait]
pub trait RatVerifierDriver: Send {
    async fn run(&mut self, ctx: &mut RatVerifierContext) -> Result<(), RatDriverError>;
}

/// The prover's view of the connection: peer messages in, RAT frames out.
pub struct RatProverContext {
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    events: Arc<EventQueue>,
    generation: u64,
}

impl RatProverContext {
    /// Next RAT message delegated from the peer's verifier, or `None` once
    /// the driver has been stopped.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.incoming.recv().await
    }

    /// Ship a RAT message to the peer's verifier.
    pub fn send(&self, data: Vec<u8>) {
        self.events.push(Event::ProverMsg {
            generation: self.generation,
            data,
        });
    }
}

/// The verifier's view of the connection: peer messages in, RAT frames out.
pub struct RatVerifierContext {
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    events: Arc<EventQueue>,
    generation: u64,
}

impl RatVerifierContext {
    /// Next RAT message delegated from the peer's prover, or `None` once the
    /// driver has been stopped.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.incoming.recv().await
    }

    /// Ship a RAT message to the peer's prover.
    pub fn send(&self, data: Vec<u8>) {
        self.events.push(Event::VerifierMsg {
            generation: self.generation,
            data,
        });
    }
}

/// Handle to a running driver task, owned by the connection worker.
pub(crate) struct DriverHandle {
    delegate: mpsc::UnboundedSender<Vec<u8>>,
    join: Option<tokio::task::JoinHandle<()>>,
    grace: Duration,
}

impl DriverHandle {
    /// Forward a peer RAT message into the driver's delegate queue.
    pub(crate) fn delegate(&self, data: Vec<u8>) {
        if self.delegate.send(data).is_err() {
            debug!("delegated RAT message dropped: driver task already finished");
        }
    }

    /// Request cooperative termination: the delegate queue closes, and a
    /// watchdog aborts the task if it is still running after the grace
    /// period.
    pub(crate) fn stop(mut self) {
        if let Some(join) = self.join.take() {
            let abort = join.abort_handle();
            let grace = self.grace;
            tokio::spawn(async move {
                if tokio::time::timeout(grace, join).await.is_err() {
                    warn!("driver ignored stop request, aborting its task");
                    abort.abort();
                }
            });
        }
        // Dropping self closes the delegate sender.
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        // Backstop for handles dropped without an explicit stop.
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

pub(crate) fn spawn_prover(
    mut driver: Box<dyn RatProverDriver>,
    events: Arc<EventQueue>,
    generation: u64,
    grace: Duration,
) -> DriverHandle {
    let (delegate, incoming) = mpsc::unbounded_channel();
    let mut ctx = RatProverContext {
        incoming,
        events: events.clone(),
        generation,
    };
    let join = tokio::spawn(async move {
        match driver.run(&mut ctx).await {
            Ok(()) => {
                debug!(generation, "RAT prover finished");
                events.push(Event::ProverOk { generation });
            }
            Err(e) => {
                warn!(generation, error = %e, "RAT prover failed");
                events.push(Event::ProverFailed { generation });
            }
        }
    });
    DriverHandle {
        delegate,
        join: Some(join),
        grace,
    }
}

pub(crate) fn spawn_verifier(
    mut driver: Box<dyn RatVerifierDriver>,
    events: Arc<EventQueue>,
    generation: u64,
    grace: Duration,
) -> DriverHandle {
    let (delegate, incoming) = mpsc::unbounded_channel();
    let mut ctx = RatVerifierContext {
        incoming,
        events: events.clone(),
        generation,
    };
    let join = tokio::spawn(async move {
        match driver.run(&mut ctx).await {
            Ok(()) => {
                debug!(generation, "RAT verifier finished");
                events.push(Event::VerifierOk { generation });
            }
            Err(e) => {
                warn!(generation, error = %e, "RAT verifier failed");
                events.push(Event::VerifierFailed { generation });
            }
        }
    });
    DriverHandle {
        delegate,
        join: Some(join),
        grace,
    }
}
