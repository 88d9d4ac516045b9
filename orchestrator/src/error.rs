//! Error types for keyswap

use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeyswapError>;

#[derive(Error, Debug)]
pub enum KeyswapError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Public key not found at {0:?}. Generate one with ssh-keygen first.")]
    MissingPublicKey(PathBuf),

    #[error("Certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("RSA key generation failed: {0}")]
    KeyGeneration(#[from] rsa::Error),

    #[error("Private key encoding failed: {0}")]
    KeyEncoding(#[from] rsa::pkcs8::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to install certificate pair ({cause}), and restoring the previous pair failed: {restore}")]
    Restore {
        cause: std::io::Error,
        restore: std::io::Error,
    },

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Input closed before a pairing key was entered")]
    NoPairingKey,

    #[error("Interrupted before the exchange completed")]
    Interrupted,

    #[error("Process error: {0}")]
    Process(String),

    #[error("Endpoint exited before shutdown was requested ({0})")]
    EndpointExited(ExitStatus),
}

impl From<nix::Error> for KeyswapError {
    fn from(err: nix::Error) -> Self {
        KeyswapError::Process(err.to_string())
    }
}
