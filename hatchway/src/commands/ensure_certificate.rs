use std::path::Path;

use anyhow::{Context, Result};
use hatchway_common::HatchwayConfig;
use hatchway_tls::ensure::{
    ensure_certificate, publish_runtime_directory, EnsureOutcome, EnsureRequest,
};
use hatchway_tls::TlsCertificateBundle;

/// Returns the process exit code: 0 when a usable certificate exists (or
/// was just created), 1 when `--check` found work to do.
pub async fn command(
    config: &HatchwayConfig,
    check: bool,
    for_gateway_tls: bool,
) -> Result<i32> {
    let directory = config
        .paths_relative_to
        .join(&config.store.gateway.certificate_directory);

    let outcome = ensure_certificate(EnsureRequest {
        directory: &directory,
        helper: &config.store.certificate.helper,
        check,
        tolerate_merged: for_gateway_tls,
    })
    .await?;

    let pair = match outcome {
        EnsureOutcome::Usable(pair) => pair,
        EnsureOutcome::WouldCreate => {
            println!("Would create a self-signed certificate");
            return Ok(1);
        }
        EnsureOutcome::WouldReissue(path) => {
            println!(
                "Found self-signed {}, but it needs to be reissued",
                path.display()
            );
            return Ok(1);
        }
    };

    if check {
        let names = TlsCertificateBundle::from_bytes(pair.certificate_pem.clone())
            .ok()
            .and_then(|bundle| bundle.names().ok())
            .unwrap_or_default();
        println!(
            "Would use certificate {} for {}",
            pair.certificate_path.display(),
            names.join(", ")
        );
    }

    if for_gateway_tls {
        let runtime_directory = std::env::var("RUNTIME_DIRECTORY")
            .context("--for-gateway-tls cannot be used unless RUNTIME_DIRECTORY is set")?;
        publish_runtime_directory(&pair, Path::new(&runtime_directory)).await?;
    }

    Ok(0)
}
