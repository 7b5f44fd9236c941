//! The dummy attestation mechanism.
//!
//! Normative only as a reference for the driver contract: the prover ships a
//! fixed "report", the verifier answers with a fixed grant, and both report
//! success. Useful for tests, demos, and deployments that defer real
//! attestation to the DAT layer.

use async_trait::async_trait;

use crate::rat::driver::{
    RatDriverError, RatProverContext, RatProverDriver, RatVerifierContext, RatVerifierDriver,
};

/// Mechanism id the dummy drivers are registered under.
pub const DUMMY_RAT_ID: &str = "Dummy";

const DUMMY_REPORT: &[u8] = b"dummy-attestation-report";
const DUMMY_GRANT: &[u8] = b"dummy-attestation-grant";

/// Prover half of the dummy mechanism.
pub struct DummyRatProver;

#[async_trait]
impl RatProverDriver for DummyRatProver {
    async fn run(&mut self, ctx: &mut RatProverContext) -> Result<(), RatDriverError> {
        ctx.send(DUMMY_REPORT.to_vec());
        match ctx.recv().await {
            Some(reply) if reply == DUMMY_GRANT => Ok(()),
            Some(_) => Err(RatDriverError::new("verifier rejected the dummy report")),
            None => Err(RatDriverError::new("stopped before the verifier answered")),
        }
    }
}

/// Verifier half of the dummy mechanism.
pub struct DummyRatVerifier;

#[async_trait]
impl RatVerifierDriver for DummyRatVerifier {
    async fn run(&mut self, ctx: &mut RatVerifierContext) -> Result<(), RatDriverError> {
        match ctx.recv().await {
            Some(report) if report == DUMMY_REPORT => {
                ctx.send(DUMMY_GRANT.to_vec());
                Ok(())
            }
            Some(_) => Err(RatDriverError::new("unexpected attestation report")),
            None => Err(RatDriverError::new("stopped before a report arrived")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::fsm::queue::EventQueue;
    use crate::fsm::Event;
    use crate::rat::driver::{spawn_prover, spawn_verifier};

    /// Run the dummy prover against the dummy verifier, relaying messages
    /// the way two connected FSMs would.
    #[tokio::test]
    async fn dummy_pair_attests_successfully() {
        let events = Arc::new(EventQueue::new(32));
        let grace = Duration::from_secs(2);

        let prover = spawn_prover(Box::new(DummyRatProver), events.clone(), 1, grace);
        let verifier = spawn_verifier(Box::new(DummyRatVerifier), events.clone(), 1, grace);

        let (mut prover_ok, mut verifier_ok) = (false, false);
        while !(prover_ok && verifier_ok) {
            match events.recv().await {
                // What the prover emits would travel as RAT_PROVER and be
                // delegated to the peer's verifier; loop it back locally.
                Event::ProverMsg { data, .. } => verifier.delegate(data),
                Event::VerifierMsg { data, .. } => prover.delegate(data),
                Event::ProverOk { .. } => prover_ok = true,
                Event::VerifierOk { .. } => verifier_ok = true,
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn verifier_rejects_unknown_report() {
        let events = Arc::new(EventQueue::new(32));
        let verifier = spawn_verifier(
            Box::new(DummyRatVerifier),
            events.clone(),
            1,
            Duration::from_secs(2),
        );

        verifier.delegate(b"not-a-dummy-report".to_vec());
        match events.recv().await {
            Event::VerifierFailed { generation } => assert_eq!(generation, 1),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
