use std::sync::Arc;

use once_cell::sync::Lazy;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::RustlsSetupError;

static ROOT_CERT_STORE: Lazy<RootCertStore> = Lazy::new(|| {
    let mut store = RootCertStore::empty();
    let result = rustls_native_certs::load_native_certs();
    for error in result.errors {
        tracing::warn!(?error, "Failed to load a native root certificate");
    }
    for cert in result.certs {
        let _ = store.add(cert);
    }
    store
});

/// TLS settings a channel may request for its outbound connection.
#[derive(Debug, Clone, Default)]
pub struct ClientTlsOptions {
    /// When false, any server certificate is accepted.
    pub validate: bool,
    /// PEM bundle replacing the default trust store.
    pub authority: Option<Vec<u8>>,
    /// Client certificate and key, both PEM.
    pub identity: Option<(Vec<u8>, Vec<u8>)>,
}

impl ClientTlsOptions {
    pub fn new() -> Self {
        Self {
            validate: true,
            ..Default::default()
        }
    }
}

fn load_identity(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), RustlsSetupError> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(RustlsSetupError::NoCertificates);
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])?
        .ok_or(RustlsSetupError::NoKeys)?;
    Ok((certs, key))
}

pub fn configure_client_tls(options: &ClientTlsOptions) -> Result<ClientConfig, RustlsSetupError> {
    let verifier: Arc<dyn ServerCertVerifier> = if !options.validate {
        Arc::new(AcceptAllServerCerts)
    } else {
        let roots = match &options.authority {
            Some(pem) => {
                let mut store = RootCertStore::empty();
                for cert in rustls_pemfile::certs(&mut &pem[..]) {
                    store.add(cert?)?;
                }
                store
            }
            None => ROOT_CERT_STORE.clone(),
        };
        WebPkiServerVerifier::builder(Arc::new(roots)).build()?
    };

    let builder = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let config = match &options.identity {
        Some((cert_pem, key_pem)) => {
            let (certs, key) = load_identity(cert_pem, key_pem)?;
            builder.with_client_auth_cert(certs, key)?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(config)
}

#[derive(Debug)]
struct AcceptAllServerCerts;

impl ServerCertVerifier for AcceptAllServerCerts {
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

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
