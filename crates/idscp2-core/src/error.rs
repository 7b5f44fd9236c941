//! Error types observable at the IDSCP2 connection API.

use thiserror::Error;

/// Errors surfaced to application code through the connection facade and the
/// `on_error` callback.
#[derive(Debug, Clone, Error)]
pub enum Idscp2Error {
    /// `send` was called outside the established state. Payloads are never
    /// queued implicitly.
    #[error("connection is not established")]
    NotEstablished,

    /// The connection has been closed.
    #[error("connection is closed")]
    Closed,

    /// The peers' supported RAT mechanism lists have no overlap.
    #[error("no matching RAT mechanism: {0}")]
    NoMatchingRat(String),

    /// A prover or verifier driver reported failure, timed out, or could not
    /// be started.
    #[error("remote attestation failed: {0}")]
    RatFailed(String),

    /// The peer's dynamic attribute token was rejected, or its certificate
    /// binding did not hold.
    #[error("invalid dynamic attribute token: {0}")]
    DatInvalid(String),

    /// The application-level handshake did not complete in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The TLS transport failed.
    #[error("transport error: {0}")]
    Tls(String),

    /// The peer sent a frame that could not be decoded; fatal for the
    /// connection.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The peer closed the connection, gracefully or not.
    #[error("peer closed the connection: {0}")]
    PeerClosed(String),

    /// A driver misbehaved in a way that is not attributable to the peer.
    #[error("internal driver error: {0}")]
    InternalDriverError(String),
}
