mod cert;
mod client;
mod error;
pub mod ensure;

pub use cert::{
    SingleCertResolver, TlsCertificateAndPrivateKey, TlsCertificateBundle, TlsPrivateKey,
};
pub use client::{configure_client_tls, ClientTlsOptions};
pub use error::RustlsSetupError;
