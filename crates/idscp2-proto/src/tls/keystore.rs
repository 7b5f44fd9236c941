//! PEM keystore with alias-forced certificate selection.
//!
//! A keystore is a directory holding one certificate chain and private key
//! per alias: `<alias>-cert.pem` (leaf first) and `<alias>-key.pem` (PKCS#8).
//! [`AliasEntry::load`] reads an alias once into a cached
//! `rustls::sign::CertifiedKey`, so TLS handshakes never rescan the store.
//!
//! The resolvers below implement the key-selection hook: rustls asks which
//! certificate to present, and we answer with exactly the configured alias —
//! iff the peer's offered signature schemes admit its key type — delegating
//! everything else to rustls' defaults. The client resolver optionally
//! requires the server's advertised CA list to contain the alias
//! certificate's issuer (`require_issuer_match`); the default is the
//! permissive behavior that accepts any issuer.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rustls::client::ResolvesClientCert;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::SignatureScheme;
use rustls_pki_types::CertificateDer;
use tracing::debug;
use x509_parser::prelude::*;

use crate::error::{ProtoError, Result};

/// Private key types a keystore alias may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa,
    Ec,
    Ed25519,
}

impl KeyType {
    /// Signature schemes a key of this type can produce.
    fn schemes(self) -> &'static [SignatureScheme] {
        match self {
            KeyType::Rsa => &[
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
            ],
            KeyType::Ec => &[
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
            ],
            KeyType::Ed25519 => &[SignatureScheme::ED25519],
        }
    }

    /// Returns true if any offered scheme is usable by this key type.
    fn is_offered(self, offered: &[SignatureScheme]) -> bool {
        offered.iter().any(|s| self.schemes().contains(s))
    }

    fn signature_algorithm(self) -> rustls::SignatureAlgorithm {
        match self {
            KeyType::Rsa => rustls::SignatureAlgorithm::RSA,
            KeyType::Ec => rustls::SignatureAlgorithm::ECDSA,
            KeyType::Ed25519 => rustls::SignatureAlgorithm::ED25519,
        }
    }
}

/// One loaded keystore alias: certificate chain, signing key, and the
/// metadata the resolvers consult on every handshake.
#[derive(Clone)]
pub struct AliasEntry {
    alias: String,
    key_type: KeyType,
    certified: Arc<CertifiedKey>,
    leaf: CertificateDer<'static>,
    issuer_dn: Vec<u8>,
}

impl AliasEntry {
    /// Load `<alias>-cert.pem` and `<alias>-key.pem` from the keystore
    /// directory, verifying the key matches the declared type.
    pub fn load(dir: &Path, alias: &str, key_type: KeyType) -> Result<Self> {
        let err = |reason: String| ProtoError::KeyStore {
            alias: alias.to_string(),
            reason,
        };

        let cert_path = dir.join(format!("{alias}-cert.pem"));
        let mut cert_reader = std::io::BufReader::new(
            std::fs::File::open(&cert_path)
                .map_err(|e| err(format!("open {}: {e}", cert_path.display())))?,
        );
        let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
            .collect::<std::io::Result<_>>()
            .map_err(|e| err(format!("read certificates: {e}")))?;
        let leaf = chain
            .first()
            .cloned()
            .ok_or_else(|| err("certificate file contains no certificates".into()))?;

        let key_path = dir.join(format!("{alias}-key.pem"));
        let mut key_reader = std::io::BufReader::new(
            std::fs::File::open(&key_path)
                .map_err(|e| err(format!("open {}: {e}", key_path.display())))?,
        );
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| err(format!("read private key: {e}")))?
            .ok_or_else(|| err("key file contains no private key".into()))?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| err(format!("unsupported private key: {e}")))?;
        if signing_key.algorithm() != key_type.signature_algorithm() {
            return Err(err(format!(
                "key algorithm {:?} does not match configured type {key_type:?}",
                signing_key.algorithm()
            )));
        }

        let (_, parsed) = X509Certificate::from_der(leaf.as_ref())
            .map_err(|e| err(format!("parse leaf certificate: {e}")))?;
        let issuer_dn = parsed.issuer().as_raw().to_vec();

        Ok(Self {
            alias: alias.to_string(),
            key_type,
            certified: Arc::new(CertifiedKey::new(chain, signing_key)),
            leaf,
            issuer_dn,
        })
    }

    /// The alias's leaf certificate (DER).
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.leaf
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }
}

impl fmt::Debug for AliasEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AliasEntry")
            .field("alias", &self.alias)
            .field("key_type", &self.key_type)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Client-side: which certificate do we present to the server?
// ---------------------------------------------------------------------------

/// Forces the configured alias as the client certificate.
pub struct AliasClientCertResolver {
    entry: AliasEntry,
    require_issuer_match: bool,
}

impl AliasClientCertResolver {
    pub fn new(entry: AliasEntry, require_issuer_match: bool) -> Self {
        Self {
            entry,
            require_issuer_match,
        }
    }
}

impl fmt::Debug for AliasClientCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AliasClientCertResolver")
            .field("alias", &self.entry.alias)
            .field("require_issuer_match", &self.require_issuer_match)
            .finish()
    }
}

impl ResolvesClientCert for AliasClientCertResolver {
    fn resolve(
        &self,
        root_hint_subjects: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        if !self.entry.key_type.is_offered(sigschemes) {
            debug!(
                alias = %self.entry.alias,
                "alias key type not usable with offered signature schemes"
            );
            return None;
        }

        if self.require_issuer_match
            && !root_hint_subjects.is_empty()
            && !root_hint_subjects
                .iter()
                .any(|subject| *subject == self.entry.issuer_dn.as_slice())
        {
            debug!(
                alias = %self.entry.alias,
                "server CA hint list does not contain the alias issuer"
            );
            return None;
        }

        Some(self.entry.certified.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Server-side: which certificate do we present to the client?
// ---------------------------------------------------------------------------

/// Forces the configured alias as the server certificate.
pub struct AliasServerCertResolver {
    entry: AliasEntry,
}

impl AliasServerCertResolver {
    pub fn new(entry: AliasEntry) -> Self {
        Self { entry }
    }
}

impl fmt::Debug for AliasServerCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AliasServerCertResolver")
            .field("alias", &self.entry.alias)
            .finish()
    }
}

impl ResolvesServerCert for AliasServerCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if !self
            .entry
            .key_type
            .is_offered(client_hello.signature_schemes())
        {
            debug!(
                alias = %self.entry.alias,
                "alias key type not usable with client's signature schemes"
            );
            return None;
        }
        Some(self.entry.certified.clone())
    }
}
