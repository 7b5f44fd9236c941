//! IDSCP2 connection engine.
//!
//! Everything between a ready secure channel and application code: the
//! per-connection state machine driving the HELLO handshake, remote
//! attestation rounds, DAT renewal, data transfer and teardown; the RAT
//! driver runtime and registries; the timer service; and the user-facing
//! connection facade.
//!
//! The transport is pluggable through [`SecureChannelHandle`] — production
//! uses the TLS channel from `idscp2-transport`, tests use in-memory pairs.

pub mod channel;
pub mod config;
pub mod connection;
pub mod dat;
pub mod error;
mod fsm;
pub mod rat;
pub mod timer;

pub use channel::{ChannelError, ChannelEvent, SecureChannelHandle};
pub use config::Idscp2Configuration;
pub use connection::{
    ConnectionListener, ConnectionPhase, Idscp2Connection, NullConnectionListener,
};
pub use dat::{Dat, DatError, DatProvider, DatVerifier};
pub use error::Idscp2Error;
pub use rat::{
    default_registries, RatDriverError, RatProverContext, RatProverDriver, RatRegistries,
    RatVerifierContext, RatVerifierDriver,
};
