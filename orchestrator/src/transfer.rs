//! HTTPS client for the transfer endpoint
//!
//! Certificate verification is switched off: the endpoint presents the self-signed
//! certificate produced by `keyswap certs`, and there is no CA to check it against.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, warn};

/// Route served by the endpoint for both directions
pub const TRANSFER_PATH: &str = "/transfer";

/// Header carrying the operator-entered pairing code
pub const PAIRING_KEY_HEADER: &str = "Pairing-Key";

/// Hex SHA-256 of a key payload, for comparing keys out of band
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Uploads the local key and fetches the counterpart's
pub struct TransferClient {
    client: reqwest::Client,
    url: String,
}

impl TransferClient {
    /// Create a client for the endpoint at `base_url` (e.g. `https://127.0.0.1:8443`)
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        warn!("TLS certificate verification is disabled for {}", base_url);

        let client = reqwest::Client::builder()
            .user_agent(format!("keyswap/{}", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), TRANSFER_PATH),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST the key as a binary body
    pub async fn upload(&self, key: Vec<u8>) -> Result<()> {
        debug!("Uploading {} bytes to {}", key.len(), self.url);

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(key)
            .send()
            .await?
            .error_for_status()?;

        debug!("Upload answered with {}", response.status());
        Ok(())
    }

    /// GET the key stored under `pairing_key`
    pub async fn retrieve(&self, pairing_key: &str) -> Result<Vec<u8>> {
        debug!("Retrieving key from {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .header(PAIRING_KEY_HEADER, pairing_key)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.bytes().await?.to_vec())
    }
}
