//! TLS connector construction.

use crate::connection::TlsClientConfig;
use crate::error::ClientError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// Builds a connector and the SNI name for `host`.
pub fn tls_connector(
    config: &TlsClientConfig,
    host: &str,
) -> Result<(TlsConnector, ServerName<'static>), ClientError> {
    let client_config = if config.insecure {
        tracing::warn!("TLS certificate verification disabled");
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipCertVerification { provider }))
            .with_no_client_auth()
    } else {
        let builder = rustls::ClientConfig::builder().with_root_certificates(root_store(config)?);
        match (&config.client_cert_path, &config.client_key_path) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
                .map_err(|e| ClientError::TlsConfig(format!("invalid client cert/key: {}", e)))?,
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(ClientError::TlsConfig(
                    "client certificate and key must be given together".to_string(),
                ))
            }
        }
    };

    let name = config.server_name.as_deref().unwrap_or(host);
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|_| ClientError::TlsConfig(format!("invalid server name: {}", name)))?;

    Ok((TlsConnector::from(Arc::new(client_config)), server_name))
}

fn root_store(config: &TlsClientConfig) -> Result<RootCertStore, ClientError> {
    let mut store = RootCertStore::empty();
    match config.ca_cert_path {
        Some(ref path) => {
            for cert in load_certs(path)? {
                store
                    .add(cert)
                    .map_err(|e| ClientError::TlsConfig(format!("invalid CA cert: {}", e)))?;
            }
        }
        None => store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(store)
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct SkipCertVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipCertVerification {
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
        verify_tls12_signature(
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
        verify_tls13_signature(
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

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;

    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open key file {:?}: {}", path, e)))?;

    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ClientError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        .ok_or_else(|| ClientError::TlsConfig(format!("no private key found in {:?}", path)))
}
