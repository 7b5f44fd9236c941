//! Dynamic attribute token (DAT) interfaces.
//!
//! A DAT is a short-lived credential binding a peer's attributes to its TLS
//! certificate. Where the tokens come from and how they are checked is the
//! deployment's business (typically a DAPS); the engine only needs the two
//! traits below. Both are called synchronously from the connection worker,
//! so implementations should be quick or cache internally.

use std::time::Duration;

use rustls_pki_types::CertificateDer;
use thiserror::Error;

/// A freshly issued local token plus how long it stays valid.
#[derive(Debug, Clone)]
pub struct Dat {
    pub token: Vec<u8>,
    pub validity: Duration,
}

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct DatError(pub String);

impl DatError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Produces this endpoint's own tokens, sent in HELLO and on renewal.
pub trait DatProvider: Send + Sync {
    fn token(&self) -> Result<Dat, DatError>;
}

/// Checks a peer token against the peer's TLS certificate, returning the
/// remaining validity on success.
pub trait DatVerifier: Send + Sync {
    fn verify(
        &self,
        token: &[u8],
        peer_certificate: &CertificateDer<'_>,
    ) -> Result<Duration, DatError>;
}

/// Accepts any token with a fixed validity. For tests and demos only; a real
/// deployment wires in a DAPS-backed verifier.
#[derive(Debug, Clone)]
pub struct AcceptAllDatVerifier {
    pub validity: Duration,
}

impl AcceptAllDatVerifier {
    pub fn new(validity: Duration) -> Self {
        Self { validity }
    }
}

impl DatVerifier for AcceptAllDatVerifier {
    fn verify(
        &self,
        _token: &[u8],
        _peer_certificate: &CertificateDer<'_>,
    ) -> Result<Duration, DatError> {
        Ok(self.validity)
    }
}

/// Issues a constant token with a fixed validity. For tests and demos only.
#[derive(Debug, Clone)]
pub struct StaticDatProvider {
    pub token: Vec<u8>,
    pub validity: Duration,
}

impl StaticDatProvider {
    pub fn new(token: impl Into<Vec<u8>>, validity: Duration) -> Self {
        Self {
            token: token.into(),
            validity,
        }
    }
}

impl DatProvider for StaticDatProvider {
    fn token(&self) -> Result<Dat, DatError> {
        Ok(Dat {
            token: self.token.clone(),
            validity: self.validity,
        })
    }
}
