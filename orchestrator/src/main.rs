//! keyswap - one-time SSH public key exchange over a self-signed HTTPS endpoint
//!
//! `keyswap certs` provisions the endpoint certificate, `keyswap serve` runs the
//! endpoint, and `keyswap` on its own runs the exchange: it uploads the local key,
//! asks for the pairing key and saves the counterpart's key.

mod certs;
mod config;
mod endpoint;
mod error;
mod exchange;
mod process;
mod transfer;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use crate::certs::CertificateProvisioner;
use crate::config::Config;
use crate::endpoint::{Endpoint, KeyStore};
use crate::error::Result;
use crate::exchange::Exchange;

#[derive(Parser)]
#[command(name = "keyswap")]
#[command(author, version, about = "One-time SSH public key exchange over a local HTTPS endpoint", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Defaults to `exchange`
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the self-signed certificate and key for the endpoint
    Certs {
        /// Replace an existing certificate and key
        #[arg(long)]
        force: bool,

        /// Certificate directory (overrides config)
        #[arg(long, value_name = "DIR")]
        cert_dir: Option<PathBuf>,
    },

    /// Run the HTTPS transfer endpoint
    Serve {
        /// Listen address (overrides config)
        #[arg(long, value_name = "ADDR")]
        addr: Option<SocketAddr>,

        /// Certificate directory (overrides config)
        #[arg(long, value_name = "DIR")]
        cert_dir: Option<PathBuf>,

        /// File the uploaded key is stored in (overrides config)
        #[arg(long, value_name = "FILE")]
        storage: Option<PathBuf>,
    },

    /// Upload the local key, then fetch the counterpart's key with a pairing key
    Exchange {
        /// Endpoint base URL (overrides config)
        #[arg(long)]
        url: Option<String>,

        /// Public key to upload (overrides config)
        #[arg(long, value_name = "FILE")]
        key: Option<PathBuf>,

        /// Where the retrieved key is written (overrides config)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Write the default configuration file
    Init {
        /// Overwrite existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(log_level.into());
    for noisy in ["hyper=warn", "reqwest=warn", "rustls=warn"] {
        if let Ok(directive) = noisy.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // stdout is reserved for the pairing prompt
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Exchange {
        url: None,
        key: None,
        output: None,
    }) {
        Commands::Certs { force, cert_dir } => {
            if let Some(dir) = cert_dir {
                config.paths.cert_dir = dir;
            }

            let provisioner =
                CertificateProvisioner::new(config.certificate.clone(), &config.paths.cert_dir);
            let provisioned = provisioner.provision(force)?;

            println!("Certificate: {}", provisioned.cert_path.display());
            println!("Private key: {}", provisioned.key_path.display());
            println!("Expires:     {}", provisioned.not_after.date());
        }

        Commands::Serve {
            addr,
            cert_dir,
            storage,
        } => {
            if let Some(addr) = addr {
                config.endpoint.bind = addr;
            }
            if let Some(dir) = cert_dir {
                config.paths.cert_dir = dir;
            }
            if let Some(path) = storage {
                config.paths.storage = path;
            }

            info!("Starting keyswap endpoint v{}", env!("CARGO_PKG_VERSION"));

            let store = Arc::new(KeyStore::new(&config.paths.storage));
            let endpoint = Endpoint::new(&config.cert_path(), &config.key_path(), store).await?;
            endpoint.run_until_signal(config.endpoint.bind).await?;
        }

        Commands::Exchange { url, key, output } => {
            if let Some(url) = url {
                config.endpoint.url = url;
            }
            if let Some(key) = key {
                config.paths.public_key = key;
            }
            if let Some(output) = output {
                config.paths.retrieved_key = output;
            }

            let command = exchange::endpoint_command(&config, cli.config.as_deref())?;
            let retrieved = Exchange::new(config, command).run().await?;
            info!("Exchange finished, counterpart key at {:?}", retrieved);
        }

        Commands::Init { force } => {
            let path = cli.config.clone().unwrap_or_else(Config::default_config_path);
            Config::initialize(&path, force)?;
            println!("Configuration initialized at: {}", path.display());
        }

        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
