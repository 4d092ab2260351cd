//! TLS Dialing
//!
//! Client side TLS towards stream targets, built once per rule. Certificates
//! are checked against the bundled web PKI roots unless verification is
//! switched off for the rule.

use std::fmt;
use std::io;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::config::Address;
use crate::error::ProxyError;

/// Wraps target connections of one rule in TLS
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
    skip_verify: bool,
}

impl TlsConnector {
    pub fn new(skip_verify: bool) -> Result<Self, ProxyError> {
        let provider = Arc::new(ring::default_provider());
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(ProxyError::TlsConfig)?;

        let config = if skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
                .with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        };

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
            skip_verify,
        })
    }

    /// Run the client handshake over an established TCP connection
    pub async fn connect(
        &self,
        target: &Address,
        stream: TcpStream,
    ) -> io::Result<TlsStream<TcpStream>> {
        self.inner.connect(server_name(target)?, stream).await
    }
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector")
            .field("skip_verify", &self.skip_verify)
            .finish()
    }
}

/// Name presented for SNI and checked against the certificate
fn server_name(target: &Address) -> io::Result<ServerName<'static>> {
    match target {
        Address::Socket(addr) => Ok(ServerName::IpAddress(addr.ip().into())),
        Address::Host { host, .. } => ServerName::try_from(host.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e)),
        Address::Unix(path) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no TLS server name for {}", path.display()),
        )),
    }
}

/// Skips certificate chain and name checks. Handshake signatures are still
/// verified, so the peer must hold the key of the certificate it sent.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
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
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_server_name_from_target() {
        let ip = Address::Socket("10.0.0.5:443".parse().unwrap());
        assert!(matches!(server_name(&ip).unwrap(), ServerName::IpAddress(_)));

        let host = Address::Host {
            host: "db.internal".to_string(),
            port: 5432,
        };
        assert!(matches!(server_name(&host).unwrap(), ServerName::DnsName(_)));

        let unix = Address::Unix(PathBuf::from("/tmp/target.sock"));
        assert_eq!(server_name(&unix).unwrap_err().kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_connector_modes() {
        assert!(!TlsConnector::new(false).unwrap().skip_verify);
        assert!(TlsConnector::new(true).unwrap().skip_verify);
    }
}
