//! TLS client configuration for encrypted Flight connections.

use crate::error::TransportError;
use crate::transport::protocol::TlsSettings;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tracing::warn;

/// Build the rustls client configuration for the given trust settings.
///
/// With verification on, the supplied CA certificates are the only trust
/// anchors; without them the bundled Mozilla roots are used. With
/// verification off any chain is accepted, but handshake signatures are still
/// checked.
pub(crate) fn client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::TlsError(format!("Unsupported protocol versions: {}", e)))?;

    let mut config = if settings.verify_server {
        builder
            .with_root_certificates(root_store(settings.ca_pem.as_deref())?)
            .with_no_client_auth()
    } else {
        warn!("Server certificate verification is disabled; any certificate will be accepted");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(&provider)))
            .with_no_client_auth()
    };

    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(Arc::new(config))
}

fn root_store(ca_pem: Option<&[u8]>) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();

    match ca_pem {
        Some(pem) => {
            let certs = parse_pem_certs(pem)?;
            if certs.is_empty() {
                return Err(TransportError::TlsError(
                    "No certificate found in CA PEM data".to_string(),
                ));
            }
            for cert in certs {
                roots.add(cert).map_err(|e| {
                    TransportError::TlsError(format!("Failed to add CA certificate: {}", e))
                })?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    Ok(roots)
}

/// Parse PEM-encoded certificates
fn parse_pem_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut reader = std::io::BufReader::new(pem);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certificates: {}", e)))
}

/// Server name presented in the TLS handshake (DNS name or IP address).
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, TransportError> {
    ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::TlsError(format!("Invalid server name '{}': {}", host, e)))
}

/// Extract a certificate rejection from a failed TLS connect.
pub(crate) fn certificate_rejection(err: &std::io::Error) -> Option<String> {
    let tls_error = err.get_ref()?.downcast_ref::<rustls::Error>()?;

    match tls_error {
        rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented => {
            Some(tls_error.to_string())
        }
        _ => None,
    }
}

/// Verifier that skips chain validation.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
