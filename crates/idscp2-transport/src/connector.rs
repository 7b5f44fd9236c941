//! Client endpoint: connect out to an IDSCP2 listener.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls_pki_types::{CertificateDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::info;

use idscp2_core::{ConnectionListener, Idscp2Configuration, Idscp2Connection};
use idscp2_proto::tls::{build_client_tls_config, TlsSetup};

use crate::channel::spawn_channel;
use crate::error::{Result, TransportError};

/// A client endpoint that opens IDSCP2 connections.
///
/// The TLS configuration (keystore alias, trust store, cipher allow-list)
/// is fixed at construction; `connect` may be called any number of times.
pub struct Idscp2Connector {
    connector: TlsConnector,
    local_certificate: CertificateDer<'static>,
    config: Arc<Idscp2Configuration>,
}

impl Idscp2Connector {
    pub fn new(tls_setup: &TlsSetup, config: Arc<Idscp2Configuration>) -> Result<Self> {
        let (tls_config, local_certificate) = build_client_tls_config(tls_setup)?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(tls_config)),
            local_certificate,
            config,
        })
    }

    /// Connect to `addr`, run the TLS handshake, and start the IDSCP2
    /// engine on the resulting channel.
    ///
    /// `server_name` sets the SNI name; pass `None` to connect by bare IP
    /// (peer verification is hostname-independent either way).
    pub async fn connect(
        &self,
        addr: SocketAddr,
        server_name: Option<&str>,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<Idscp2Connection> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect(format!("{addr}: {e}")))?;
        tcp.set_nodelay(true)?;

        let name: ServerName<'static> = match server_name {
            Some(name) => ServerName::try_from(name.to_string())
                .map_err(|e| TransportError::Connect(format!("invalid server name: {e}")))?,
            None => ServerName::IpAddress(addr.ip().into()),
        };

        let tls = self
            .connector
            .connect(name, tcp)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let peer_certificate = {
            let (_, tls_state) = tls.get_ref();
            tls_state
                .peer_certificates()
                .and_then(|certs| certs.first())
                .cloned()
                .ok_or(TransportError::MissingPeerCertificate)?
        };

        info!(%addr, "secure channel established");

        let channel = spawn_channel(
            tls,
            self.local_certificate.clone(),
            peer_certificate,
            self.config.max_frame_bytes,
        );
        Ok(Idscp2Connection::spawn(
            channel,
            self.config.clone(),
            listener,
        ))
    }
}
