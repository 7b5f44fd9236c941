//! IDSCP2 wire message types.
//!
//! Hand-derived prost structs matching `proto/idscp2_messages.proto`
//! (field numbers must stay in sync with that file). Deriving by hand keeps
//! `protoc` out of the build; the encoding is byte-identical to a compiled
//! schema and deterministic for a given message value.
//!
//! The constructor helpers at the bottom build the exact frames the FSM
//! emits, so call sites stay free of `oneof` boilerplate.

/// Top-level frame body. Every wire frame is exactly one `IdscpMessage`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IdscpMessage {
    #[prost(oneof = "Body", tags = "1, 2, 3, 4, 5, 6, 7, 8")]
    pub body: Option<Body>,
}

/// The message variants of the IDSCP2 dialect.
#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum Body {
    #[prost(message, tag = "1")]
    Hello(IdscpHello),
    #[prost(message, tag = "2")]
    Dat(IdscpDat),
    #[prost(message, tag = "3")]
    DatExpired(IdscpDatExpired),
    #[prost(message, tag = "4")]
    RatProver(IdscpRatProver),
    #[prost(message, tag = "5")]
    RatVerifier(IdscpRatVerifier),
    #[prost(message, tag = "6")]
    ReRat(IdscpReRat),
    #[prost(message, tag = "7")]
    Data(IdscpData),
    #[prost(message, tag = "8")]
    Close(IdscpClose),
}

/// Opening message of the application-level handshake. Both peers send one.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IdscpHello {
    #[prost(message, optional, tag = "1")]
    pub dat: Option<IdscpDat>,
    /// RAT mechanism ids this peer can prove with, in preference order.
    #[prost(string, repeated, tag = "2")]
    pub supported_rat_provers: Vec<String>,
    /// RAT mechanism ids this peer can verify, in preference order.
    #[prost(string, repeated, tag = "3")]
    pub supported_rat_verifiers: Vec<String>,
    /// SHA-256 over the sender's TLS leaf certificate (DER).
    #[prost(bytes = "vec", tag = "4")]
    pub attestation_cert_hash: Vec<u8>,
}

/// A dynamic attribute token.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IdscpDat {
    #[prost(bytes = "vec", tag = "1")]
    pub token: Vec<u8>,
}

/// Request for a fresh DAT from the peer.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct IdscpDatExpired {}

/// Opaque attestation evidence from the sender's prover driver.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IdscpRatProver {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

/// Opaque attestation challenge/result from the sender's verifier driver.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IdscpRatVerifier {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

/// Demand that the receiver re-run attestation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IdscpReRat {
    #[prost(string, tag = "1")]
    pub cause: String,
}

/// User payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IdscpData {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IdscpClose {
    #[prost(enumeration = "CloseCause", tag = "1")]
    pub cause_code: i32,
    #[prost(string, tag = "2")]
    pub cause_msg: String,
}

impl IdscpClose {
    /// The decoded close cause; unknown codes collapse to [`CloseCause::Error`].
    pub fn cause(&self) -> CloseCause {
        CloseCause::try_from(self.cause_code).unwrap_or(CloseCause::Error)
    }
}

/// Reason codes carried by [`IdscpClose`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CloseCause {
    UserShutdown = 0,
    Timeout = 1,
    Error = 2,
    NoValidDat = 3,
    NoRatMechanism = 4,
    RatProverFailed = 5,
    RatVerifierFailed = 6,
}

// ---------------------------------------------------------------------------
// Constructor helpers
// ---------------------------------------------------------------------------

fn message(body: Body) -> IdscpMessage {
    IdscpMessage { body: Some(body) }
}

pub fn hello(
    dat_token: Vec<u8>,
    supported_rat_provers: Vec<String>,
    supported_rat_verifiers: Vec<String>,
    attestation_cert_hash: Vec<u8>,
) -> IdscpMessage {
    message(Body::Hello(IdscpHello {
        dat: Some(IdscpDat { token: dat_token }),
        supported_rat_provers,
        supported_rat_verifiers,
        attestation_cert_hash,
    }))
}

pub fn dat(token: Vec<u8>) -> IdscpMessage {
    message(Body::Dat(IdscpDat { token }))
}

pub fn dat_expired() -> IdscpMessage {
    message(Body::DatExpired(IdscpDatExpired {}))
}

pub fn rat_prover(data: Vec<u8>) -> IdscpMessage {
    message(Body::RatProver(IdscpRatProver { data }))
}

pub fn rat_verifier(data: Vec<u8>) -> IdscpMessage {
    message(Body::RatVerifier(IdscpRatVerifier { data }))
}

pub fn re_rat(cause: &str) -> IdscpMessage {
    message(Body::ReRat(IdscpReRat {
        cause: cause.to_string(),
    }))
}

pub fn data(payload: Vec<u8>) -> IdscpMessage {
    message(Body::Data(IdscpData { payload }))
}

pub fn close(cause_code: CloseCause, cause_msg: &str) -> IdscpMessage {
    message(Body::Close(IdscpClose {
        cause_code: cause_code as i32,
        cause_msg: cause_msg.to_string(),
    }))
}
