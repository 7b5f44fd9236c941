//! IDSCP2 transport layer.
//!
//! Mutually authenticated TLS over TCP, bridged to the `idscp2-core`
//! connection engine:
//!
//! - [`Idscp2Connector`]: client endpoint (connect, TLS handshake,
//!   connection construction)
//! - [`Idscp2Listener`]: server endpoint (bind, accept loop)
//! - framed reader/writer tasks translating between the TLS stream and the
//!   engine's channel events

mod channel;
pub mod connector;
pub mod error;
pub mod listener;

pub use connector::Idscp2Connector;
pub use error::TransportError;
pub use listener::Idscp2Listener;
