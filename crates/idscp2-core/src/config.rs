//! Per-connection configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::dat::{DatProvider, DatVerifier};
use crate::rat::registry::{default_registries, RatRegistries};

/// Configuration for one IDSCP2 connection (typically shared by all
/// connections of an endpoint).
#[derive(Clone)]
pub struct Idscp2Configuration {
    /// How long the application-level handshake may take before the
    /// connection is closed.
    pub handshake_timeout: Duration,
    /// Watchdog for a single attestation round.
    pub rat_timeout: Duration,
    /// How often attestation is re-run while established.
    pub rat_refresh_interval: Duration,
    /// RAT mechanisms this endpoint can prove with, in preference order.
    pub supported_rat_provers: Vec<String>,
    /// RAT mechanisms this endpoint can verify, in preference order.
    pub supported_rat_verifiers: Vec<String>,
    /// Issues this endpoint's own DATs.
    pub dat_provider: Arc<dyn DatProvider>,
    /// Validates peer DATs.
    pub dat_verifier: Arc<dyn DatVerifier>,
    /// Where prover/verifier drivers are looked up. Defaults to the
    /// process-wide registries.
    pub registries: Arc<RatRegistries>,
    /// Largest frame body accepted from the wire.
    pub max_frame_bytes: usize,
    /// Capacity of the connection event queue.
    pub event_queue_capacity: usize,
    /// Grace period for cooperative driver shutdown before the task is
    /// aborted.
    pub driver_stop_grace: Duration,
}

impl Idscp2Configuration {
    /// Configuration with the documented defaults. DAT handling has no
    /// sensible default and must be supplied.
    pub fn new(dat_provider: Arc<dyn DatProvider>, dat_verifier: Arc<dyn DatVerifier>) -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            rat_timeout: Duration::from_secs(20),
            rat_refresh_interval: Duration::from_secs(600),
            supported_rat_provers: vec![crate::rat::dummy::DUMMY_RAT_ID.to_string()],
            supported_rat_verifiers: vec![crate::rat::dummy::DUMMY_RAT_ID.to_string()],
            dat_provider,
            dat_verifier,
            registries: default_registries(),
            max_frame_bytes: idscp2_proto::codec::DEFAULT_MAX_FRAME_BYTES,
            event_queue_capacity: 64,
            driver_stop_grace: Duration::from_secs(2),
        }
    }
}

impl std::fmt::Debug for Idscp2Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Idscp2Configuration")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("rat_timeout", &self.rat_timeout)
            .field("rat_refresh_interval", &self.rat_refresh_interval)
            .field("supported_rat_provers", &self.supported_rat_provers)
            .field("supported_rat_verifiers", &self.supported_rat_verifiers)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("event_queue_capacity", &self.event_queue_capacity)
            .field("driver_stop_grace", &self.driver_stop_grace)
            .finish_non_exhaustive()
    }
}
