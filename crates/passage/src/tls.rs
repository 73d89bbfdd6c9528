//! TLS utilities.
//!
//! Certificate loading for the listener, client configurations for upstream
//! connections, and a no-op verifier used when certificate verification is
//! disabled (`secure = false`).

use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore};
use tokio_rustls::TlsAcceptor;

use crate::error::ProxyError;
use crate::target::TargetTls;

/// No-op certificate verifier backing `secure = false`.
///
/// # Warning
/// This disables all TLS security checks - use only against upstreams you
/// control.
#[derive(Debug)]
pub struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let file = std::fs::File::open(path)
        .map_err(|e| ProxyError::Tls(format!("failed to open certificate file '{}': {e}", path.display())))?;
    let mut reader = std::io::BufReader::new(file);
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| ProxyError::Tls(format!("failed to parse certificate file: {e}")))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "no certificates found in file: {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let file = std::fs::File::open(path)
        .map_err(|e| ProxyError::Tls(format!("failed to open private key file '{}': {e}", path.display())))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProxyError::Tls(format!("failed to parse private key file: {e}")))?
        .ok_or_else(|| ProxyError::Tls(format!("no private key found in file: {}", path.display())))
}

/// Create a TLS acceptor for the listener from PEM certificate and key files.
pub fn create_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ProxyError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(format!("failed to build server TLS configuration: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a rustls client configuration for an upstream connection.
///
/// With `secure = false` certificate verification is disabled entirely.
/// Otherwise the webpki trust anchors are used, extended with any CA bundle
/// attached to the target; client-auth material on the target is presented
/// when both cert and key are configured.
pub fn client_config(secure: bool, tls: Option<&TargetTls>) -> Result<ClientConfig, ProxyError> {
    let builder = if secure {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(ca_path) = tls.and_then(|t| t.ca.as_deref()) {
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| ProxyError::Tls(format!("invalid CA certificate: {e}")))?;
            }
        }
        ClientConfig::builder().with_root_certificates(roots)
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
    };

    let identity = tls.and_then(|t| match (&t.cert, &t.key) {
        (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
        _ => None,
    });
    match identity {
        Some((cert_path, key_path)) => {
            let certs = load_certs(&cert_path)?;
            let key = load_key(&key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ProxyError::Tls(format!("invalid client auth material: {e}")))
        }
        None => Ok(builder.with_no_client_auth()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_verifier_supported_schemes() {
        let verifier = NoVerifier;
        let schemes = verifier.supported_verify_schemes();
        assert!(!schemes.is_empty());
        assert!(schemes.contains(&rustls::SignatureScheme::RSA_PKCS1_SHA256));
        assert!(schemes.contains(&rustls::SignatureScheme::ED25519));
    }

    #[test]
    fn test_client_config_insecure_builds() {
        assert!(client_config(false, None).is_ok());
    }

    #[test]
    fn test_client_config_secure_builds() {
        assert!(client_config(true, None).is_ok());
    }

    #[test]
    fn test_missing_cert_file_is_reported() {
        let err = match create_tls_acceptor(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem")) {
            Ok(_) => panic!("expected create_tls_acceptor to fail"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), "tls");
    }
}
