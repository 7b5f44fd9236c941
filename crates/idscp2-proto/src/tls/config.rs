//! TLS configuration builders for IDSCP2 endpoints.
//!
//! Constructs `rustls::ClientConfig` and `rustls::ServerConfig` with mutual
//! authentication, TLS 1.2/1.3, an optional cipher-suite allow-list, the
//! alias-forcing certificate resolvers, and hostname-independent peer
//! verification against a PEM trust store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pki_types::CertificateDer;

use crate::error::{ProtoError, Result};
use crate::tls::keystore::{
    AliasClientCertResolver, AliasEntry, AliasServerCertResolver, KeyType,
};
use crate::tls::verifier::HostnameIndependentVerifier;

/// Everything needed to stand up one side of the TLS channel.
#[derive(Debug, Clone)]
pub struct TlsSetup {
    /// Directory holding `<alias>-cert.pem` / `<alias>-key.pem` pairs.
    pub key_store_dir: PathBuf,
    /// The alias this endpoint presents, regardless of what else the store
    /// contains.
    pub certificate_alias: String,
    /// Expected key type of the alias.
    pub key_type: KeyType,
    /// PEM file with the trust anchors for peer verification.
    pub trust_store_path: PathBuf,
    /// Allowed cipher suites by name (e.g. `TLS13_AES_256_GCM_SHA384`).
    /// `None` keeps the provider defaults.
    pub cipher_suites: Option<Vec<String>>,
    /// Only present the client certificate when the server's CA hint list
    /// contains its issuer. Defaults to false, accepting any issuer.
    pub require_issuer_match: bool,
}

impl TlsSetup {
    pub fn new(
        key_store_dir: impl Into<PathBuf>,
        certificate_alias: impl Into<String>,
        key_type: KeyType,
        trust_store_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            key_store_dir: key_store_dir.into(),
            certificate_alias: certificate_alias.into(),
            key_type,
            trust_store_path: trust_store_path.into(),
            cipher_suites: None,
            require_issuer_match: false,
        }
    }
}

/// Build the client-side TLS config.
///
/// Returns the config plus the alias leaf certificate, which the connection
/// layer hashes into its HELLO message.
pub fn build_client_tls_config(
    setup: &TlsSetup,
) -> Result<(rustls::ClientConfig, CertificateDer<'static>)> {
    let provider = crypto_provider(setup)?;
    let roots = Arc::new(load_trust_store(&setup.trust_store_path)?);
    let entry = AliasEntry::load(
        &setup.key_store_dir,
        &setup.certificate_alias,
        setup.key_type,
    )?;
    let leaf = entry.leaf().clone();

    let verifier = Arc::new(HostnameIndependentVerifier::new(roots, provider.clone())?);
    let resolver = Arc::new(AliasClientCertResolver::new(
        entry,
        setup.require_issuer_match,
    ));

    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| ProtoError::TlsConfiguration(format!("TLS version config: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_cert_resolver(resolver);

    Ok((config, leaf))
}

/// Build the server-side TLS config. Client certificates are required and
/// verified against the trust store.
pub fn build_server_tls_config(
    setup: &TlsSetup,
) -> Result<(rustls::ServerConfig, CertificateDer<'static>)> {
    let provider = crypto_provider(setup)?;
    let roots = Arc::new(load_trust_store(&setup.trust_store_path)?);
    let entry = AliasEntry::load(
        &setup.key_store_dir,
        &setup.certificate_alias,
        setup.key_type,
    )?;
    let leaf = entry.leaf().clone();

    let client_verifier = WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
        .build()
        .map_err(|e| ProtoError::TlsConfiguration(format!("client verifier: {e}")))?;
    let resolver = Arc::new(AliasServerCertResolver::new(entry));

    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| ProtoError::TlsConfiguration(format!("TLS version config: {e}")))?
        .with_client_cert_verifier(client_verifier)
        .with_cert_resolver(resolver);

    Ok((config, leaf))
}

/// Ring provider, restricted to the configured cipher allow-list if one is
/// set.
fn crypto_provider(setup: &TlsSetup) -> Result<Arc<CryptoProvider>> {
    let mut provider = rustls::crypto::ring::default_provider();

    if let Some(allowed) = &setup.cipher_suites {
        provider
            .cipher_suites
            .retain(|suite| allowed.iter().any(|name| *name == suite_name(suite)));
        if provider.cipher_suites.is_empty() {
            return Err(ProtoError::TlsConfiguration(
                "cipher allow-list matches no supported suites".into(),
            ));
        }
    }

    Ok(Arc::new(provider))
}

fn suite_name(suite: &rustls::SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

/// Load PEM trust anchors into a root store.
pub fn load_trust_store(path: &Path) -> Result<RootCertStore> {
    let mut reader = std::io::BufReader::new(
        std::fs::File::open(path)
            .map_err(|e| ProtoError::TrustStore(format!("open {}: {e}", path.display())))?,
    );

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| ProtoError::TrustStore(format!("read certificate: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| ProtoError::TrustStore(format!("add root: {e}")))?;
    }

    if roots.is_empty() {
        return Err(ProtoError::TrustStore(format!(
            "{} contains no trust anchors",
            path.display()
        )));
    }

    Ok(roots)
}
