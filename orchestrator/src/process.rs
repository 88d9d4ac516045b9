//! Endpoint child process handling and signal plumbing

use crate::error::{KeyswapError, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Install ring as the process-wide rustls provider. Safe to call repeatedly.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Resolves on Ctrl-C (SIGINT) or SIGTERM
pub async fn shutdown_signal() -> Result<()> {
    let mut terminate = unix_signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }

    Ok(())
}

/// Program and arguments used to launch the endpoint
#[derive(Debug, Clone)]
pub struct EndpointCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Redirect stdout/stderr here instead of inheriting the terminal
    pub log_file: Option<PathBuf>,
}

/// A running endpoint, owned by the orchestrator
pub struct EndpointProcess {
    child: Child,
    pid: u32,
}

impl EndpointProcess {
    /// Start the endpoint in the background
    pub fn spawn(command: &EndpointCommand) -> Result<Self> {
        debug!("Endpoint command: {:?} {:?}", command.program, command.args);

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(log_path) = &command.log_file {
            let log_file = create_log(log_path)?;
            cmd.stdout(Stdio::from(log_file.try_clone()?))
                .stderr(Stdio::from(log_file));
        }

        let child = cmd.spawn().map_err(|e| {
            KeyswapError::Process(format!(
                "Failed to spawn endpoint {:?}: {}",
                command.program, e
            ))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| KeyswapError::Process("Endpoint exited immediately".into()))?;

        info!("Endpoint started with PID: {}", pid);
        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking check; reaps the child if it has exited
    pub fn has_exited(&mut self) -> Result<bool> {
        Ok(self.child.try_wait()?.is_some())
    }

    /// Wait for the endpoint to exit on its own
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// SIGTERM, then SIGKILL once `grace` runs out. Always reaps the child.
    pub async fn terminate(mut self, grace: Duration) -> Result<ExitStatus> {
        if self.has_exited()? {
            let status = self.child.wait().await?;
            debug!("Endpoint already exited: {}", status);
            return Ok(status);
        }

        info!("Stopping endpoint (PID: {})", self.pid);

        match signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(e.into()),
        }

        match timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!("Endpoint stopped ({})", status);
                Ok(status)
            }
            Err(_) => {
                warn!("Endpoint ignored SIGTERM for {:?}, sending SIGKILL", grace);
                self.child.kill().await?;
                let status = self.child.wait().await?;
                info!("Endpoint killed ({})", status);
                Ok(status)
            }
        }
    }
}

fn create_log(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(fs::File::create(path)?)
}
