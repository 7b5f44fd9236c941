//! Error types for the transport layer.

use thiserror::Error;

/// Errors that can occur while establishing or operating an endpoint.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bind failed: {0}")]
    Bind(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("peer presented no certificate")]
    MissingPeerCertificate,

    #[error("protocol error: {0}")]
    Proto(#[from] idscp2_proto::error::ProtoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
