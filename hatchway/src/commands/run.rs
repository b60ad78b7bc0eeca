use std::sync::Arc;

use anyhow::{bail, Context, Result};
use hatchway_common::HatchwayConfig;
use hatchway_core::Services;
use hatchway_tls::ensure::{ensure_certificate, EnsureOutcome, EnsureRequest};
use hatchway_tls::{
    SingleCertResolver, TlsCertificateAndPrivateKey, TlsCertificateBundle, TlsPrivateKey,
};
use poem::http::uri::Scheme;
use poem::listener::{Acceptor, Listener, TcpListener};
use poem::middleware::AddData;
use poem::web::{LocalAddr, RemoteAddr};
use poem::{get, post, EndpointExt, Route, Server};
use rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tracing::info;

/// TLS in front of the plain TCP acceptor, serving the ensured server
/// certificate through its resolver.
struct GatewayTlsAcceptor<T> {
    inner: T,
    tls_acceptor: tokio_rustls::TlsAcceptor,
}

impl<T> GatewayTlsAcceptor<T> {
    fn new(inner: T, server_config: ServerConfig) -> Self {
        Self {
            inner,
            tls_acceptor: tokio_rustls::TlsAcceptor::from(Arc::new(server_config)),
        }
    }
}

impl<T> Acceptor for GatewayTlsAcceptor<T>
where
    T: Acceptor,
{
    type Io = TlsStream<T::Io>;

    fn local_addr(&self) -> Vec<LocalAddr> {
        self.inner.local_addr()
    }

    async fn accept(
        &mut self,
    ) -> std::io::Result<(Self::Io, LocalAddr, RemoteAddr, Scheme)> {
        let (stream, local_addr, remote_addr, _) = self.inner.accept().await?;
        let tls_stream = self.tls_acceptor.accept(stream).await?;
        Ok((tls_stream, local_addr, remote_addr, Scheme::HTTPS))
    }
}

pub async fn command(config: HatchwayConfig) -> Result<()> {
    let directory = config
        .paths_relative_to
        .join(&config.store.gateway.certificate_directory);

    let outcome = ensure_certificate(EnsureRequest {
        directory: &directory,
        helper: &config.store.certificate.helper,
        check: false,
        tolerate_merged: true,
    })
    .await
    .context("failed to ensure a server certificate")?;

    let EnsureOutcome::Usable(pair) = outcome else {
        bail!("certificate setup did not produce usable credentials");
    };
    info!(certificate = %pair.certificate_path.display(), "Using server certificate");

    let certificate_and_key = TlsCertificateAndPrivateKey {
        certificate: TlsCertificateBundle::from_file(&pair.certificate_path)
            .await
            .with_context(|| {
                format!(
                    "reading TLS certificate from '{}'",
                    pair.certificate_path.display()
                )
            })?,
        private_key: TlsPrivateKey::from_file(&pair.key_path).await.with_context(|| {
            format!("reading TLS private key from '{}'", pair.key_path.display())
        })?,
    };

    let tls_config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| anyhow::anyhow!("Failed to configure TLS protocol versions: {e}"))?
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(SingleCertResolver::new(certificate_and_key)));

    let listen = config.store.gateway.listen.clone();
    let services = Services::new(config);

    let app = Route::new()
        .at("/login", post(crate::socket::login))
        .at("/socket", get(crate::socket::socket))
        .with(AddData::new(services));

    info!(%listen, "Accepting connections");
    let tcp_acceptor = TcpListener::bind(listen).into_acceptor().await?;
    Server::new_with_acceptor(GatewayTlsAcceptor::new(tcp_acceptor, tls_config))
        .run_with_graceful_shutdown(
            app,
            async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutting down");
            },
            None,
        )
        .await?;
    Ok(())
}
