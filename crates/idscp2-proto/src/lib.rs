//! IDSCP2 wire protocol definitions.
//!
//! Shared protocol layer used by `idscp2-core` and `idscp2-transport`:
//!
//! - Wire message types (prost), mirroring `proto/idscp2_messages.proto`
//! - Length-prefixed framing codec
//! - Shared error types
//! - TLS configuration: PEM keystore with alias-forced certificate
//!   selection, hostname-independent peer verification, config builders

pub mod codec;
pub mod error;
pub mod tls;
pub mod wire;
