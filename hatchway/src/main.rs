use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use hatchway_common::{HatchwayConfig, HatchwayConfigStore};

mod commands;
mod logging;
mod socket;

#[derive(Parser)]
#[command(name = "hatchway", about = "Remote web administration gateway")]
pub struct Cli {
    /// Configuration file
    #[arg(long, short, default_value = "/etc/hatchway/config.json")]
    pub config: PathBuf,

    /// Increase log verbosity
    #[arg(long, short, action = ArgAction::Count)]
    pub debug: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Run,
    /// Speak the bridge protocol on stdio (spawned by a gateway)
    Bridge,
    /// Make sure a usable TLS server certificate exists
    EnsureCertificate {
        /// Only report what would be done
        #[arg(long)]
        check: bool,
        /// Publish fresh copies into $RUNTIME_DIRECTORY for the TLS
        /// front-end; tolerates merged cert/key files
        #[arg(long)]
        for_gateway_tls: bool,
    },
}

fn load_config(path: &Path) -> Result<HatchwayConfig> {
    let store: HatchwayConfigStore = match std::fs::read_to_string(path) {
        Ok(data) => serde_json::from_str(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => HatchwayConfigStore::default(),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    Ok(HatchwayConfig {
        store,
        paths_relative_to: path.parent().unwrap_or(Path::new("/")).to_owned(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    // The bridge owns stdout for the protocol; logs must not pollute it.
    let log_to_stderr = matches!(cli.command, Commands::Bridge);
    logging::init_logging(&cli, log_to_stderr)?;

    match cli.command {
        Commands::Run => commands::run::command(config).await,
        Commands::Bridge => hatchway_core::Bridge::run_stdio(config).await,
        Commands::EnsureCertificate {
            check,
            for_gateway_tls,
        } => {
            let code = commands::ensure_certificate::command(&config, check, for_gateway_tls)
                .await?;
            std::process::exit(code);
        }
    }
}
