//! Transfer orchestrator - runs the one-time key exchange
//!
//! Sequence:
//! 1. Local public key must exist, otherwise abort before anything else happens
//! 2. Start the endpoint as a child process
//! 3. Sleep a fixed delay so it can start listening (no readiness probe)
//! 4. Upload the local key
//! 5. Prompt for the pairing key
//! 6. Download the counterpart's key and write it out, replacing any old copy
//! 7. Keep the endpoint up until interrupted
//! 8. Terminate the endpoint

use crate::config::Config;
use crate::error::{KeyswapError, Result};
use crate::process::{self, EndpointCommand, EndpointProcess};
use crate::transfer::{fingerprint, TransferClient};
use std::ffi::OsString;
use std::fs;
use std::future::Future;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Command line that re-invokes this executable as `keyswap serve`
pub fn endpoint_command(config: &Config, config_path: Option<&Path>) -> Result<EndpointCommand> {
    let program = std::env::current_exe()?;

    let mut args: Vec<OsString> = Vec::new();
    if let Some(path) = config_path {
        args.push("--config".into());
        args.push(path.into());
    }
    args.push("serve".into());
    args.push("--addr".into());
    args.push(config.endpoint.bind.to_string().into());
    args.push("--cert-dir".into());
    args.push(config.paths.cert_dir.clone().into());
    args.push("--storage".into());
    args.push(config.paths.storage.clone().into());

    Ok(EndpointCommand {
        program,
        args,
        log_file: config.paths.endpoint_log.clone(),
    })
}

/// Prompt on stdout and read the first non-blank line from `reader`.
///
/// The read happens on a detached thread: a blocking stdin read cannot be cancelled,
/// and it must not keep the runtime alive after an interrupt.
pub async fn read_pairing_key<R>(reader: R) -> Result<String>
where
    R: BufRead + Send + 'static,
{
    print!("Enter pairing key: ");
    io::stdout().flush()?;

    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let _ = tx.send(first_non_blank_line(reader));
    });

    rx.await
        .map_err(|_| KeyswapError::Process("Pairing key reader stopped unexpectedly".into()))?
}

fn first_non_blank_line<R: BufRead>(reader: R) -> Result<String> {
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    Err(KeyswapError::NoPairingKey)
}

/// Drives one exchange against the endpoint
pub struct Exchange {
    config: Config,
    endpoint: EndpointCommand,
}

impl Exchange {
    pub fn new(config: Config, endpoint: EndpointCommand) -> Self {
        Self { config, endpoint }
    }

    /// Run interactively: pairing key from stdin, stop on Ctrl-C or SIGTERM
    pub async fn run(&self) -> Result<PathBuf> {
        self.run_with(
            read_pairing_key(io::BufReader::new(io::stdin())),
            process::shutdown_signal(),
        )
        .await
    }

    /// Run with an explicit pairing key source and shutdown trigger
    pub async fn run_with<P, S>(&self, pairing_key: P, shutdown: S) -> Result<PathBuf>
    where
        P: Future<Output = Result<String>>,
        S: Future<Output = Result<()>>,
    {
        let key_path = &self.config.paths.public_key;
        if !key_path.is_file() {
            error!("Public key not found at {:?}", key_path);
            return Err(KeyswapError::MissingPublicKey(key_path.clone()));
        }
        let key = fs::read(key_path)?;

        let mut endpoint = EndpointProcess::spawn(&self.endpoint)?;

        let result = self.drive(&mut endpoint, key, pairing_key, shutdown).await;

        // The endpoint never outlives the orchestrator, whatever happened above
        match endpoint.terminate(self.config.exchange.shutdown_grace()).await {
            Ok(_) => result,
            Err(e) if result.is_ok() => Err(e),
            Err(e) => {
                warn!("Failed to stop endpoint: {}", e);
                result
            }
        }
    }

    async fn drive<P, S>(
        &self,
        endpoint: &mut EndpointProcess,
        key: Vec<u8>,
        pairing_key: P,
        shutdown: S,
    ) -> Result<PathBuf>
    where
        P: Future<Output = Result<String>>,
        S: Future<Output = Result<()>>,
    {
        tokio::pin!(shutdown);

        let retrieved = tokio::select! {
            result = self.transfer(key, pairing_key) => result?,
            result = &mut shutdown => {
                result?;
                warn!("Interrupted, stopping endpoint (PID: {})", endpoint.pid());
                return Err(KeyswapError::Interrupted);
            }
            status = endpoint.wait() => return Err(KeyswapError::EndpointExited(status?)),
        };

        println!(
            "Counterpart key saved to {}. Endpoint stays up until Ctrl-C.",
            retrieved.display()
        );

        tokio::select! {
            result = &mut shutdown => {
                result?;
                info!("Interrupt received, shutting down");
                Ok(retrieved)
            }
            status = endpoint.wait() => Err(KeyswapError::EndpointExited(status?)),
        }
    }

    /// Steps 3 to 6: delay, upload, prompt, download
    async fn transfer<P>(&self, key: Vec<u8>, pairing_key: P) -> Result<PathBuf>
    where
        P: Future<Output = Result<String>>,
    {
        let exchange = &self.config.exchange;
        sleep(exchange.startup_delay()).await;

        let client = TransferClient::new(&self.config.endpoint.url, exchange.request_timeout())?;

        info!(
            "Uploading {:?} to {} (sha256 {})",
            self.config.paths.public_key,
            client.url(),
            fingerprint(&key)
        );
        client.upload(key).await?;
        info!("Upload complete");

        let pairing_key = pairing_key.await?;
        let retrieved = client.retrieve(&pairing_key).await?;

        let output = self.config.paths.retrieved_key.clone();
        fs::write(&output, &retrieved)?;
        info!(
            "Wrote {} bytes to {:?} (sha256 {})",
            retrieved.len(),
            output,
            fingerprint(&retrieved)
        );

        Ok(output)
    }
}
