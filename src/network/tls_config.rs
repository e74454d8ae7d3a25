/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! TLS configuration for the QUIC listeners and TLS upstreams
//!
//! Provides:
//! - Server configuration loaded from PEM files for the DoQ/SCION listeners
//! - Pre-built client configurations for DNS-over-TLS upstream connections
//!   (secure mode validates against the webpki roots, insecure mode skips
//!   certificate validation and is meant for testing)
//!
//! Client configurations are lazily initialized and cached for reuse.

use crate::core::error::{DnsError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, DigitallySignedStruct, Error, RootCertStore, ServerConfig, SignatureScheme,
};
use std::fmt::{Debug, Formatter};
use std::fs::File;
use std::io::BufReader;
use std::sync::{Arc, Once};
use tracing::info;

lazy_static::lazy_static! {
    /// Secure TLS configuration with certificate validation
    static ref SECURE_CONFIG: Arc<ClientConfig> = Arc::new(build_secure_config());

    /// Insecure TLS configuration (no certificate validation)
    static ref INSECURE_CONFIG: Arc<ClientConfig> = Arc::new(build_insecure_config());
}

static DEFAULT_PROVIDER: Once = Once::new();

/// Install ring as the process-wide rustls crypto provider (first call wins)
pub fn install_default_provider() {
    DEFAULT_PROVIDER.call_once(|| {
        // Err means another component already installed a provider, which is fine
        let _ = ring::default_provider().install_default();
    })
}

fn build_secure_config() -> ClientConfig {
    install_default_provider();
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

/// **WARNING**: Skips all certificate validation. Use only for testing!
fn build_insecure_config() -> ClientConfig {
    install_default_provider();
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertVerification))
        .with_no_client_auth()
}

/// Get secure TLS configuration (with certificate validation)
pub fn secure_client_config() -> Arc<ClientConfig> {
    SECURE_CONFIG.clone()
}

/// Get insecure TLS configuration (no certificate validation)
///
/// **WARNING**: Only use for testing/development!
pub fn insecure_client_config() -> Arc<ClientConfig> {
    INSECURE_CONFIG.clone()
}

/// Client-side TLS material for one upstream
#[derive(Clone, Debug)]
pub struct UpstreamTls {
    pub config: Arc<ClientConfig>,
    pub server_name: ServerName<'static>,
}

impl UpstreamTls {
    /// Build client TLS material for `server_name`
    pub fn new(server_name: &str, insecure_skip_verify: bool) -> Result<Self> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| DnsError::config(format!("invalid TLS server name {server_name}: {e}")))?;
        let config = if insecure_skip_verify {
            insecure_client_config()
        } else {
            secure_client_config()
        };
        Ok(Self {
            config,
            server_name,
        })
    }
}

/// Load TLS certificates and private key from files
///
/// Returns `None` when neither path is configured, and an error when only one
/// of them is.
pub fn load_tls_config(cert: &Option<String>, key: &Option<String>) -> Option<Result<ServerConfig>> {
    match (cert, key) {
        (Some(cert), Some(key)) => {
            info!("Loading TLS configuration: cert={}, key={}", cert, key);
            Some(load_tls_config_from_path(cert, key))
        }
        (Some(_), None) => Some(Err(DnsError::config("cert specified but key is missing"))),
        (None, Some(_)) => Some(Err(DnsError::config("key specified but cert is missing"))),
        (None, None) => None,
    }
}

fn load_tls_config_from_path(cert_path: &str, key_path: &str) -> Result<ServerConfig> {
    let cert_file = File::open(cert_path).map_err(|e| {
        DnsError::config(format!(
            "Failed to open certificate file {}: {}",
            cert_path, e
        ))
    })?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            DnsError::config(format!(
                "Failed to parse certificate file {}: {}",
                cert_path, e
            ))
        })?;

    if certs.is_empty() {
        return Err(DnsError::config(format!(
            "No certificates found in {}",
            cert_path
        )));
    }

    let key_file = File::open(key_path).map_err(|e| {
        DnsError::config(format!(
            "Failed to open private key file {}: {}",
            key_path, e
        ))
    })?;
    let mut key_reader = BufReader::new(key_file);

    // PKCS8, RSA and EC keys are all accepted
    let private_key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| {
            DnsError::config(format!(
                "Failed to parse private key file {}: {}",
                key_path, e
            ))
        })?
        .ok_or_else(|| DnsError::config(format!("No private key found in {}", key_path)))?;

    server_config_from_der(certs, private_key)
}

/// Build a TLS server configuration from an in-memory chain and key
pub fn server_config_from_der(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    install_default_provider();
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| DnsError::config(format!("Failed to build TLS configuration: {}", e)))
}

/// Certificate verifier that accepts any certificate (INSECURE!)
struct NoCertVerification;

impl Debug for NoCertVerification {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "NoCertVerification")
    }
}

impl ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> std::result::Result<ServerCertVerified, Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
