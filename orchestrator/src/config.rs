//! Configuration management for keyswap

use crate::error::{KeyswapError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Files read and written by the tool
    pub paths: PathsConfig,

    /// Self-signed certificate parameters
    pub certificate: CertificateConfig,

    /// HTTPS endpoint settings
    pub endpoint: EndpointConfig,

    /// Orchestrator timings
    pub exchange: ExchangeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Local SSH public key to upload
    pub public_key: PathBuf,

    /// Where the counterpart's key is written
    pub retrieved_key: PathBuf,

    /// Directory holding server.crt and server.key
    pub cert_dir: PathBuf,

    /// Where the endpoint keeps the last uploaded key
    pub storage: PathBuf,

    /// Endpoint child output (None = inherit the terminal)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateConfig {
    /// Subject common name, also used as the DNS SAN
    pub common_name: String,

    /// Validity period in days, starting now
    pub validity_days: u32,

    /// RSA modulus size
    pub key_bits: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Address the endpoint listens on
    pub bind: SocketAddr,

    /// Base URL the orchestrator talks to
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Fixed delay between launching the endpoint and uploading
    pub startup_delay_ms: u64,

    /// Per-request timeout
    pub request_timeout_secs: u64,

    /// Time the endpoint gets to exit after SIGTERM before SIGKILL
    pub shutdown_grace_secs: u64,
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            public_key: Config::default_public_key(),
            retrieved_key: PathBuf::from("retrieved_key.pub"),
            cert_dir: PathBuf::from("certs"),
            storage: Config::default_data_dir().join("uploaded_key.pub"),
            endpoint_log: None,
        }
    }
}

impl Default for CertificateConfig {
    fn default() -> Self {
        CertificateConfig {
            common_name: "localhost".into(),
            validity_days: 365,
            key_bits: 4096,
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 8443)),
            url: "https://127.0.0.1:8443".into(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            startup_delay_ms: 2000,
            request_timeout_secs: 30,
            shutdown_grace_secs: 5,
        }
    }
}

impl ExchangeConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Config {
    /// `$HOME/.ssh/id_rsa.pub`
    pub fn default_public_key() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".ssh").join("id_rsa.pub"))
            .unwrap_or_else(|| PathBuf::from(".ssh/id_rsa.pub"))
    }

    /// Get the default data directory
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("keyswap"))
            .unwrap_or_else(|| PathBuf::from(".keyswap"))
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("keyswap").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("keyswap.toml"))
    }

    /// Load configuration from file, falling back to defaults when it does not exist
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_path = config_path
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_config_path);

        if config_path.exists() {
            info!("Loading configuration from {:?}", config_path);
            let content = fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Write the default configuration to `path`
    pub fn initialize(path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            return Err(KeyswapError::Config(format!(
                "Configuration already exists at {:?}. Use --force to overwrite.",
                path
            )));
        }

        Self::default().save(path)?;

        info!("Configuration initialized at {:?}", path);
        Ok(())
    }

    /// `<cert_dir>/server.crt`
    pub fn cert_path(&self) -> PathBuf {
        self.paths.cert_dir.join(crate::certs::CERT_FILE)
    }

    /// `<cert_dir>/server.key`
    pub fn key_path(&self) -> PathBuf {
        self.paths.cert_dir.join(crate::certs::KEY_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.endpoint.bind.port(), 8443);
        assert_eq!(config.endpoint.url, "https://127.0.0.1:8443");
        assert_eq!(config.certificate.common_name, "localhost");
        assert_eq!(config.certificate.validity_days, 365);
        assert_eq!(config.certificate.key_bits, 4096);
        assert_eq!(config.paths.retrieved_key, PathBuf::from("retrieved_key.pub"));
        assert!(config.paths.public_key.ends_with(".ssh/id_rsa.pub"));
        assert_eq!(config.cert_path(), PathBuf::from("certs/server.crt"));
        assert_eq!(config.key_path(), PathBuf::from("certs/server.key"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [endpoint]
            bind = "127.0.0.1:9443"
            url = "https://127.0.0.1:9443"

            [certificate]
            key_bits = 2048
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint.bind.port(), 9443);
        assert_eq!(config.certificate.key_bits, 2048);
        assert_eq!(config.certificate.validity_days, 365);
        assert_eq!(config.exchange.startup_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.exchange.startup_delay_ms = 250;
        config.paths.endpoint_log = Some(dir.path().join("endpoint.log"));
        config.save(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.exchange.startup_delay_ms, 250);
        assert_eq!(loaded.paths.endpoint_log, config.paths.endpoint_log);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.endpoint.bind.port(), 8443);
    }

    #[test]
    fn test_initialize_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        Config::initialize(&path, false).unwrap();
        assert!(matches!(
            Config::initialize(&path, false),
            Err(KeyswapError::Config(_))
        ));
        Config::initialize(&path, true).unwrap();
    }
}
