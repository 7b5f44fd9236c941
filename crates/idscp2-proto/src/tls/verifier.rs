//! Hostname-independent peer certificate verification.
//!
//! IDSCP2 peers are identified by their certificate and the attestation
//! handshake bound to it, not by DNS names: connections are routinely made
//! to bare IP addresses in industrial networks. The verifier below delegates
//! chain building, signature checks, and validity windows to rustls'
//! webpki verifier over the configured trust roots, and tolerates exactly
//! the name-mismatch error class.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::{CertificateError, DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tracing::debug;

use crate::error::{ProtoError, Result};

/// Server certificate verifier that checks the chain against the configured
/// trust store but ignores the server name.
#[derive(Debug)]
pub struct HostnameIndependentVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl HostnameIndependentVerifier {
    pub fn new(roots: Arc<RootCertStore>, provider: Arc<CryptoProvider>) -> Result<Self> {
        let inner = WebPkiServerVerifier::builder_with_provider(roots, provider)
            .build()
            .map_err(|e| ProtoError::TlsConfiguration(format!("webpki verifier: {e}")))?;
        Ok(Self { inner })
    }
}

impl ServerCertVerifier for HostnameIndependentVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(TlsError::InvalidCertificate(CertificateError::NotValidForName))
            | Err(TlsError::InvalidCertificate(
                CertificateError::NotValidForNameContext { .. },
            )) => {
                debug!("accepting peer certificate despite name mismatch");
                Ok(ServerCertVerified::assertion())
            }
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
