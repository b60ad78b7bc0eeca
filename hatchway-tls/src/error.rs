#[derive(thiserror::Error, Debug)]
pub enum RustlsSetupError {
    #[error("rustls: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("no certificates found in certificate file")]
    NoCertificates,
    #[error("no private keys found in key file")]
    NoKeys,
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("X.509: {0}")]
    X509(#[from] x509_parser::error::X509Error),
    #[error("PEM: {0}")]
    Pem(#[from] x509_parser::error::PEMError),
    #[error("verifier: {0}")]
    Verifier(#[from] rustls::client::VerifierBuilderError),
}
