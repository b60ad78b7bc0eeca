use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ResolvesServerCert;
use rustls::sign::{CertifiedKey, SigningKey};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use x509_parser::prelude::{FromDer, GeneralName, ParsedExtension, X509Certificate};

use crate::RustlsSetupError;

#[derive(Debug, Clone)]
pub struct TlsCertificateBundle {
    certificates: Vec<CertificateDer<'static>>,
}

#[derive(Debug, Clone)]
pub struct TlsPrivateKey {
    key: Arc<dyn SigningKey>,
}

#[derive(Debug, Clone)]
pub struct TlsCertificateAndPrivateKey {
    pub certificate: TlsCertificateBundle,
    pub private_key: TlsPrivateKey,
}

impl TlsCertificateBundle {
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RustlsSetupError> {
        let mut file = File::open(path).await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, RustlsSetupError> {
        let certificates = rustls_pemfile::certs(&mut &bytes[..])
            .collect::<Result<Vec<CertificateDer<'static>>, _>>()?;

        if certificates.is_empty() {
            return Err(RustlsSetupError::NoCertificates);
        }
        Ok(Self { certificates })
    }

    /// Names the leaf certificate is valid for: subject alternative names
    /// first, then the subject common name.
    pub fn names(&self) -> Result<Vec<String>, RustlsSetupError> {
        let Some(cert_der) = self.certificates.first() else {
            return Ok(Vec::new());
        };

        let (_, cert) =
            X509Certificate::from_der(cert_der).map_err(|e| RustlsSetupError::X509(e.into()))?;

        let mut names = Vec::new();

        if let Some(san_ext) = cert
            .extensions()
            .iter()
            .find(|ext| ext.oid == x509_parser::oid_registry::OID_X509_EXT_SUBJECT_ALT_NAME)
        {
            if let ParsedExtension::SubjectAlternativeName(san) = san_ext.parsed_extension() {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns_name) => {
                            names.push(dns_name.to_string());
                        }
                        GeneralName::IPAddress(ip_bytes) => {
                            if let Ok(octets) = <[u8; 4]>::try_from(*ip_bytes) {
                                names.push(Ipv4Addr::from(octets).to_string());
                            } else if let Ok(octets) = <[u8; 16]>::try_from(*ip_bytes) {
                                names.push(Ipv6Addr::from(octets).to_string());
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        if let Some(subject) = cert.subject().iter_common_name().next() {
            if let Ok(cn) = subject.as_str() {
                names.push(cn.to_string());
            }
        }

        let mut unique_names = Vec::new();
        for name in names {
            if !unique_names.contains(&name) {
                unique_names.push(name);
            }
        }

        Ok(unique_names)
    }
}

impl TlsPrivateKey {
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RustlsSetupError> {
        let mut file = File::open(path).await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, RustlsSetupError> {
        let key = match rustls_pemfile::pkcs8_private_keys(&mut bytes.as_slice()).next() {
            Some(Ok(key)) => Some(PrivateKeyDer::from(key)),
            _ => None,
        }
        .or_else(
            || match rustls_pemfile::ec_private_keys(&mut bytes.as_slice()).next() {
                Some(Ok(key)) => Some(PrivateKeyDer::from(key)),
                _ => None,
            },
        )
        .or_else(
            || match rustls_pemfile::rsa_private_keys(&mut bytes.as_slice()).next() {
                Some(Ok(key)) => Some(PrivateKeyDer::from(key)),
                _ => None,
            },
        );

        let key = key.ok_or(RustlsSetupError::NoKeys)?;
        let key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)?;

        Ok(Self { key })
    }
}

impl From<TlsCertificateAndPrivateKey> for CertifiedKey {
    fn from(val: TlsCertificateAndPrivateKey) -> Self {
        let cert = val.certificate;
        let key = val.private_key;
        CertifiedKey {
            cert: cert.certificates,
            key: key.key,
            ocsp: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SingleCertResolver(Arc<CertifiedKey>);

impl SingleCertResolver {
    pub fn new(inner: TlsCertificateAndPrivateKey) -> Self {
        Self(Arc::new(inner.into()))
    }
}

impl ResolvesServerCert for SingleCertResolver {
    fn resolve(
        &self,
        _client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_serves_the_single_certificate() {
        let (cert_pem, key_pem) = crate::ensure::generate_self_signed().unwrap();
        let resolver = SingleCertResolver::new(TlsCertificateAndPrivateKey {
            certificate: TlsCertificateBundle::from_bytes(cert_pem.into_bytes()).unwrap(),
            private_key: TlsPrivateKey::from_bytes(key_pem.into_bytes()).unwrap(),
        });
        assert_eq!(resolver.0.cert.len(), 1);
    }

    #[test]
    fn test_names_of_generated_certificate() {
        let (cert_pem, _) = crate::ensure::generate_self_signed().unwrap();
        let bundle = TlsCertificateBundle::from_bytes(cert_pem.into_bytes()).unwrap();
        let names = bundle.names().unwrap();
        assert!(names.contains(&"localhost".to_string()));
        assert!(names.contains(&"127.0.0.1".to_string()));
    }
}
