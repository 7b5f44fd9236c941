//! The seam between the connection engine and a secure channel.
//!
//! The transport crate (or an in-memory pair in tests) owns the actual TLS
//! stream and hands the engine a [`SecureChannelHandle`]: the certificates
//! captured at TLS completion plus the two channel halves. The writer side
//! treats a dropped `outbound` sender as the close signal and shuts the TLS
//! stream down; the reader side reports a half-closed socket as
//! [`ChannelEvent::Eof`].

use rustls_pki_types::CertificateDer;
use thiserror::Error;
use tokio::sync::mpsc;

use idscp2_proto::wire::IdscpMessage;

/// Fatal conditions reported by the channel reader.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// A frame failed length or protobuf validation. Fatal.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The TLS stream failed.
    #[error("transport error: {0}")]
    Transport(String),
}

/// What the channel reader delivers to the connection engine.
#[derive(Debug)]
pub enum ChannelEvent {
    /// One complete, decoded wire message.
    Message(IdscpMessage),
    /// The peer half-closed or closed the stream.
    Eof,
    /// The stream died; no further events follow.
    Error(ChannelError),
}

/// A ready secure channel, as handed to [`Idscp2Connection::spawn`].
///
/// [`Idscp2Connection::spawn`]: crate::connection::Idscp2Connection::spawn
pub struct SecureChannelHandle {
    /// This endpoint's TLS leaf certificate (DER), hashed into HELLO.
    pub local_certificate: CertificateDer<'static>,
    /// The peer's TLS leaf certificate (DER), immutable for the connection's
    /// life; used for DAT binding.
    pub peer_certificate: CertificateDer<'static>,
    /// Encoded frames to put on the wire. Dropping the sender closes the
    /// channel.
    pub outbound: mpsc::Sender<Vec<u8>>,
    /// Decoded frames and terminal conditions from the wire, in arrival
    /// order.
    pub inbound: mpsc::Receiver<ChannelEvent>,
}

/// Capacity of the outbound frame buffer between the engine and the writer
/// task.
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Build a connected pair of in-memory channel handles for tests: frames
/// written by one side arrive decoded at the other.
///
/// The `local`/`peer` certificates are swapped between the two handles, as a
/// real TLS handshake would produce.
pub fn in_memory_pair(
    cert_a: CertificateDer<'static>,
    cert_b: CertificateDer<'static>,
) -> (SecureChannelHandle, SecureChannelHandle) {
    let (a_out_tx, a_out_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_CHANNEL_CAPACITY);
    let (b_out_tx, b_out_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_CHANNEL_CAPACITY);
    let (a_in_tx, a_in_rx) = mpsc::channel::<ChannelEvent>(OUTBOUND_CHANNEL_CAPACITY);
    let (b_in_tx, b_in_rx) = mpsc::channel::<ChannelEvent>(OUTBOUND_CHANNEL_CAPACITY);

    // a → b
    tokio::spawn(pump_frames(a_out_rx, b_in_tx));
    // b → a
    tokio::spawn(pump_frames(b_out_rx, a_in_tx));

    let a = SecureChannelHandle {
        local_certificate: cert_a.clone(),
        peer_certificate: cert_b.clone(),
        outbound: a_out_tx,
        inbound: a_in_rx,
    };
    let b = SecureChannelHandle {
        local_certificate: cert_b,
        peer_certificate: cert_a,
        outbound: b_out_tx,
        inbound: b_in_rx,
    };
    (a, b)
}

/// Decode frames from one side's writer and deliver them to the other
/// side's reader, ending with `Eof` when the writer is dropped.
async fn pump_frames(
    mut frames: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<ChannelEvent>,
) {
    let mut decoder =
        idscp2_proto::codec::FrameDecoder::new(idscp2_proto::codec::DEFAULT_MAX_FRAME_BYTES);
    while let Some(frame) = frames.recv().await {
        decoder.extend(&frame);
        loop {
            match decoder.next() {
                Ok(Some(msg)) => {
                    if events.send(ChannelEvent::Message(msg)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = events
                        .send(ChannelEvent::Error(ChannelError::MalformedFrame(
                            e.to_string(),
                        )))
                        .await;
                    return;
                }
            }
        }
    }
    let _ = events.send(ChannelEvent::Eof).await;
}
