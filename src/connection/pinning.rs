//! CA-fingerprint pinning.
//!
//! When a deployment pins its fleet CA, the TLS handshake accepts exactly the
//! chains whose root-most presented certificate hashes (SHA-256) to the
//! configured fingerprint. The verifier replaces WebPKI chain validation;
//! session resumption does not re-run verification, so resumed handshakes
//! are treated as already verified.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};

use crate::errors::Error;

/// Hex SHA-256 of a DER certificate, lowercase, no separators.
pub fn sha256_fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Compare fingerprints ignoring case and colon separators.
pub fn fingerprints_match(left: &str, right: &str) -> bool {
    let norm = |s: &str| {
        s.chars()
            .filter(|c| *c != ':')
            .map(|c| c.to_ascii_lowercase())
            .collect::<String>()
    };
    norm(left) == norm(right)
}

/// Check a presented chain against a pinned fingerprint.
///
/// The chain is ordered end-entity first; the last certificate is the
/// root-most one the peer presented and is the one hashed. An empty chain is
/// rejected.
pub fn verify_chain_fingerprint(chain: &[&[u8]], expected: &str) -> Result<(), String> {
    let Some(root_most) = chain.last() else {
        return Err("CA fingerprint check failed: peer presented an empty certificate chain"
            .to_owned());
    };
    let actual = sha256_fingerprint(root_most);
    if fingerprints_match(&actual, expected) {
        Ok(())
    } else {
        Err(format!(
            "CA fingerprint mismatch: expected {expected}, chain root has {actual}"
        ))
    }
}

#[derive(Debug)]
pub struct CaFingerprintVerifier {
    expected: String,
    provider: Arc<CryptoProvider>,
}

impl CaFingerprintVerifier {
    pub fn new(expected: impl Into<String>, provider: Arc<CryptoProvider>) -> Self {
        CaFingerprintVerifier {
            expected: expected.into(),
            provider,
        }
    }
}

impl ServerCertVerifier for CaFingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut chain: Vec<&[u8]> = Vec::with_capacity(1 + intermediates.len());
        chain.push(end_entity.as_ref());
        chain.extend(intermediates.iter().map(|c| c.as_ref()));
        verify_chain_fingerprint(&chain, &self.expected)
            .map(|()| ServerCertVerified::assertion())
            .map_err(rustls::Error::General)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// A rustls client config that replaces WebPKI validation with the pin check.
pub fn pinned_tls_config(fingerprint: &str) -> Result<rustls::ClientConfig, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = CaFingerprintVerifier::new(fingerprint, Arc::clone(&provider));
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Configuration(format!("TLS protocol setup failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(config)
}
