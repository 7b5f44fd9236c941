//! Error types for the `idscp2-proto` crate.

use thiserror::Error;

/// Errors that can occur within the `idscp2-proto` crate.
#[derive(Debug, Error)]
pub enum ProtoError {
    // --- Framing ---
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame of {got} bytes exceeds the {limit}-byte limit")]
    FrameTooLarge { got: u64, limit: u64 },

    // --- Keystore / trust store ---
    #[error("keystore error for alias {alias}: {reason}")]
    KeyStore { alias: String, reason: String },

    #[error("trust store error: {0}")]
    TrustStore(String),

    // --- TLS ---
    #[error("TLS configuration error: {0}")]
    TlsConfiguration(String),

    #[error("certificate verification failed: {0}")]
    CertificateVerification(String),

    // --- Serialization ---
    #[error("protobuf encode error: {0}")]
    ProtobufEncode(#[from] prost::EncodeError),

    #[error("protobuf decode error: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using [`ProtoError`].
pub type Result<T> = std::result::Result<T, ProtoError>;
