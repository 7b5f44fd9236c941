//! Server endpoint: accept inbound IDSCP2 connections.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls_pki_types::CertificateDer;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use idscp2_core::{ConnectionListener, Idscp2Configuration, Idscp2Connection};
use idscp2_proto::tls::{build_server_tls_config, TlsSetup};

use crate::channel::spawn_channel;
use crate::error::{Result, TransportError};

/// A server endpoint accepting IDSCP2 connections.
pub struct Idscp2Listener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
    local_certificate: CertificateDer<'static>,
    config: Arc<Idscp2Configuration>,
}

impl Idscp2Listener {
    /// Bind a TLS server socket. Client certificates are required and
    /// checked against the configured trust store.
    pub async fn bind(
        addr: SocketAddr,
        tls_setup: &TlsSetup,
        config: Arc<Idscp2Configuration>,
    ) -> Result<Self> {
        let (tls_config, local_certificate) = build_server_tls_config(tls_setup)?;
        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Bind(format!("{addr}: {e}")))?;

        info!(%addr, "listener bound");

        Ok(Self {
            tcp,
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            local_certificate,
            config,
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp.local_addr()?)
    }

    /// Accept the next connection: TCP accept, TLS handshake, engine
    /// construction. A handshake failure with one client is logged and the
    /// next connection is awaited — a bad peer never takes the listener
    /// down.
    pub async fn accept(
        &self,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<Idscp2Connection> {
        loop {
            let (tcp, peer_addr) = self.tcp.accept().await?;
            if let Err(e) = tcp.set_nodelay(true) {
                warn!(%peer_addr, error = %e, "set_nodelay failed");
            }

            let tls = match self.acceptor.accept(tcp).await {
                Ok(tls) => tls,
                Err(e) => {
                    warn!(%peer_addr, error = %e, "TLS handshake failed, awaiting next connection");
                    continue;
                }
            };

            let peer_certificate = {
                let (_, tls_state) = tls.get_ref();
                tls_state
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .cloned()
            };
            let Some(peer_certificate) = peer_certificate else {
                warn!(%peer_addr, "peer presented no certificate, awaiting next connection");
                continue;
            };

            info!(%peer_addr, "accepted secure channel");

            let channel = spawn_channel(
                tls,
                self.local_certificate.clone(),
                peer_certificate,
                self.config.max_frame_bytes,
            );
            return Ok(Idscp2Connection::spawn(
                channel,
                self.config.clone(),
                listener,
            ));
        }
    }
}
