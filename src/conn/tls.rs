//! TLS upgrade after IDENTIFY.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use super::transport::BoxedStream;
use crate::config::{TlsConfig, TlsVersion};
use crate::error::{NsqError, Result};

/// Build a rustls client configuration from [`TlsConfig`].
pub(crate) fn client_config(tls: &TlsConfig) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let versions: &[&'static rustls::SupportedProtocolVersion] = match tls.min_version {
        TlsVersion::Tls12 => &[&rustls::version::TLS13, &rustls::version::TLS12],
        TlsVersion::Tls13 => &[&rustls::version::TLS13],
    };
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(versions)?;

    let builder = if tls.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier(provider)))
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(path) = &tls.root_ca_file {
            for cert in load_certs(path)? {
                roots.add(cert)?;
            }
        }
        builder.with_root_certificates(roots)
    };

    let config = match (&tls.cert_file, &tls.key_file) {
        (Some(cert), Some(key)) => builder.with_client_auth_cert(load_certs(cert)?, load_key(key)?)?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(NsqError::Config(
                "tls cert_file and key_file must be set together".to_string(),
            ))
        }
    };
    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(NsqError::Config(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| NsqError::Config(format!("no private key in {}", path.display())))
}

/// Run the TLS handshake over an established stream.
pub(crate) async fn upgrade(stream: BoxedStream, host: &str, tls: &TlsConfig) -> Result<BoxedStream> {
    let config = client_config(tls)?;
    let name = tls.server_name.as_deref().unwrap_or(host).to_string();
    let server_name = ServerName::try_from(name.clone())
        .map_err(|e| NsqError::Handshake(format!("invalid TLS server name {:?}: {}", name, e)))?;

    let tls_stream = TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|e| NsqError::Handshake(format!("TLS handshake with {} failed: {}", host, e)))?;
    tracing::debug!("TLS established with {}", host);
    Ok(Box::new(tls_stream))
}

/// Accepts every server certificate; signatures are still checked.
#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
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
    fn test_default_config_builds() {
        assert!(client_config(&TlsConfig::default()).is_ok());
    }

    #[test]
    fn test_tls13_only() {
        let tls = TlsConfig {
            min_version: TlsVersion::Tls13,
            insecure_skip_verify: true,
            ..TlsConfig::default()
        };
        assert!(client_config(&tls).is_ok());
    }

    #[test]
    fn test_missing_root_ca_file() {
        let tls = TlsConfig {
            root_ca_file: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..TlsConfig::default()
        };
        assert!(matches!(client_config(&tls), Err(NsqError::Io(_))));
    }
}
