//! Reader/writer tasks bridging a TLS stream to the connection engine.
//!
//! The writer drains encoded frames from the engine and shuts the stream
//! down (TLS close_notify + FIN) once the engine drops its sender. The
//! reader decodes frames incrementally and forwards them in arrival order;
//! a clean peer shutdown becomes [`ChannelEvent::Eof`], a framing violation
//! or I/O failure becomes a fatal [`ChannelEvent::Error`].

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use idscp2_core::channel::{
    ChannelError, ChannelEvent, SecureChannelHandle, OUTBOUND_CHANNEL_CAPACITY,
};
use idscp2_proto::codec::FrameDecoder;
use rustls_pki_types::CertificateDer;

/// Split an established TLS stream into reader/writer tasks and return the
/// channel handle the engine consumes.
pub(crate) fn spawn_channel<S>(
    stream: S,
    local_certificate: CertificateDer<'static>,
    peer_certificate: CertificateDer<'static>,
    max_frame_bytes: usize,
) -> SecureChannelHandle
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<ChannelEvent>(OUTBOUND_CHANNEL_CAPACITY);

    tokio::spawn(write_loop(writer, out_rx));
    tokio::spawn(read_loop(reader, in_tx, max_frame_bytes));

    SecureChannelHandle {
        local_certificate,
        peer_certificate,
        outbound: out_tx,
        inbound: in_rx,
    }
}

async fn write_loop<W>(mut writer: W, mut frames: mpsc::Receiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(error = %e, "frame write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            debug!(error = %e, "frame flush failed");
            break;
        }
    }
    // Sender dropped (or the stream died): close our write half.
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(mut reader: R, events: mpsc::Sender<ChannelEvent>, max_frame_bytes: usize)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new(max_frame_bytes);
    let mut buf = [0u8; 8 * 1024];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = events.send(ChannelEvent::Eof).await;
                return;
            }
            Ok(n) => {
                decoder.extend(&buf[..n]);
                loop {
                    match decoder.next() {
                        Ok(Some(msg)) => {
                            if events.send(ChannelEvent::Message(msg)).await.is_err() {
                                // Engine gone; nothing left to deliver to.
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
            Err(e) => {
                let _ = events
                    .send(ChannelEvent::Error(ChannelError::Transport(e.to_string())))
                    .await;
                return;
            }
        }
    }
}
