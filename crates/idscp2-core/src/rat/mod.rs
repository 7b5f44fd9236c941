//! Remote attestation (RAT) drivers: the pluggable prover/verifier boundary.
//!
//! A prover produces attestation evidence for the peer; a verifier evaluates
//! the peer's evidence. Implementations are registered by mechanism id and
//! started per attestation round by the connection engine.

pub mod driver;
pub mod dummy;
pub mod registry;

pub use driver::{
    RatDriverError, RatProverContext, RatProverDriver, RatVerifierContext, RatVerifierDriver,
};
pub use dummy::{DummyRatProver, DummyRatVerifier, DUMMY_RAT_ID};
pub use registry::{default_registries, RatProverRegistry, RatRegistries, RatVerifierRegistry};
