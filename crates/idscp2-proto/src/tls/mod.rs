//! TLS configuration for IDSCP2 secure channels.
//!
//! - [`keystore`]: PEM keystore with alias-forced certificate selection
//! - [`verifier`]: hostname-independent peer certificate verification
//! - [`config`]: `rustls` client/server config builders

pub mod config;
pub mod keystore;
pub mod verifier;

pub use config::{build_client_tls_config, build_server_tls_config, TlsSetup};
pub use keystore::KeyType;
