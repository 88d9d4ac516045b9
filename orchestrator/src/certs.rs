//! Self-signed certificate provisioning for the HTTPS endpoint
//!
//! Produces `server.key` (PKCS#8 RSA, PEM) and `server.crt` (self-signed X.509, PEM)
//! in the certificate directory. Both files are staged as temporaries next to their
//! final location and only renamed into place once both are fully written.

use crate::config::CertificateConfig;
use crate::error::{KeyswapError, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_RSA_SHA256};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::rand_core::OsRng;
use rsa::RsaPrivateKey;
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

pub const CERT_FILE: &str = "server.crt";
pub const KEY_FILE: &str = "server.key";

/// ring refuses to sign with anything smaller
const MIN_KEY_BITS: usize = 2048;

/// Result of a successful provisioning run
#[derive(Debug)]
pub struct ProvisionedCert {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub not_after: OffsetDateTime,
}

/// Generates the certificate/key pair consumed by the endpoint
pub struct CertificateProvisioner {
    settings: CertificateConfig,
    dir: PathBuf,
}

impl CertificateProvisioner {
    pub fn new(settings: CertificateConfig, dir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            dir: dir.into(),
        }
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    /// Generate a fresh key and certificate and write them to the certificate directory.
    ///
    /// Refuses to replace an existing pair unless `force` is set.
    pub fn provision(&self, force: bool) -> Result<ProvisionedCert> {
        self.validate()?;

        let cert_path = self.cert_path();
        let key_path = self.key_path();

        if !force && (cert_path.exists() || key_path.exists()) {
            return Err(KeyswapError::Config(format!(
                "Certificate files already exist in {:?}. Use --force to overwrite.",
                self.dir
            )));
        }

        fs::create_dir_all(&self.dir)?;

        let private_key = self.generate_private_key()?;
        let key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?;
        let key_der = private_key.to_pkcs8_der()?;

        let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(
            &PrivatePkcs8KeyDer::from(key_der.as_bytes()),
            &PKCS_RSA_SHA256,
        )?;

        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before
            .checked_add(time::Duration::days(i64::from(self.settings.validity_days)))
            .ok_or_else(|| {
                KeyswapError::Config("Certificate validity period out of range".into())
            })?;

        let mut params = CertificateParams::new(vec![self.settings.common_name.clone()])?;
        let mut subject = DistinguishedName::new();
        subject.push(DnType::CommonName, self.settings.common_name.clone());
        params.distinguished_name = subject;
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params.self_signed(&key_pair)?;
        debug!("Self-signed certificate for {} created", self.settings.common_name);

        write_pair(&cert_path, cert.pem().as_bytes(), &key_path, key_pem.as_bytes())?;

        info!("Wrote {:?} and {:?}", cert_path, key_path);
        info!("Certificate valid until {}", not_after.date());

        Ok(ProvisionedCert {
            cert_path,
            key_path,
            not_after,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.settings.key_bits < MIN_KEY_BITS {
            return Err(KeyswapError::Config(format!(
                "RSA key size must be at least {} bits, got {}",
                MIN_KEY_BITS, self.settings.key_bits
            )));
        }
        if self.settings.validity_days == 0 {
            return Err(KeyswapError::Config(
                "Certificate validity must be at least one day".into(),
            ));
        }
        if self.settings.common_name.trim().is_empty() {
            return Err(KeyswapError::Config("Certificate common name is empty".into()));
        }
        Ok(())
    }

    fn generate_private_key(&self) -> Result<RsaPrivateKey> {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_message(format!(
            "Generating {}-bit RSA key...",
            self.settings.key_bits
        ));
        spinner.enable_steady_tick(Duration::from_millis(120));

        let key = RsaPrivateKey::new(&mut OsRng, self.settings.key_bits);

        spinner.finish_and_clear();
        Ok(key?)
    }
}

/// Stage both files, then move them into place. Never leaves only one of them behind:
/// an existing pair is set aside first and put back if either rename fails.
fn write_pair(cert_path: &Path, cert_pem: &[u8], key_path: &Path, key_pem: &[u8]) -> Result<()> {
    let dir = key_path.parent().unwrap_or_else(|| Path::new("."));

    // NamedTempFile is created 0600, which is what the key wants
    let mut key_tmp = NamedTempFile::new_in(dir)?;
    key_tmp.write_all(key_pem)?;
    key_tmp.as_file().sync_all()?;

    let mut cert_tmp = NamedTempFile::new_in(dir)?;
    cert_tmp.write_all(cert_pem)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        cert_tmp
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))?;
    }
    cert_tmp.as_file().sync_all()?;

    let mut previous = Vec::new();
    for path in [key_path, cert_path] {
        if !path.is_file() {
            continue;
        }
        let backup = backup_path(path);
        if let Err(e) = fs::rename(path, &backup) {
            return Err(roll_back(e, None, &previous));
        }
        debug!("Moved {:?} aside to {:?}", path, backup);
        previous.push((path.to_path_buf(), backup));
    }

    if let Err(e) = key_tmp.persist(key_path) {
        return Err(roll_back(e.error, None, &previous));
    }
    if let Err(e) = cert_tmp.persist(cert_path) {
        return Err(roll_back(e.error, Some(key_path), &previous));
    }

    for (_, backup) in &previous {
        if let Err(e) = fs::remove_file(backup) {
            warn!("Could not remove old certificate file {:?}: {}", backup, e);
        }
    }

    Ok(())
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".old");
    path.with_file_name(name)
}

/// Undo a partial install: drop the new key, then move the old files back.
fn roll_back(
    cause: io::Error,
    installed_key: Option<&Path>,
    previous: &[(PathBuf, PathBuf)],
) -> KeyswapError {
    let mut restore_error = None;

    if let Some(key_path) = installed_key {
        match fs::remove_file(key_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => restore_error = Some(e),
        }
    }

    for (original, backup) in previous.iter().rev() {
        if let Err(e) = fs::rename(backup, original) {
            error!("Could not restore {:?} from {:?}: {}", original, backup, e);
            restore_error.get_or_insert(e);
        }
    }

    match restore_error {
        None => cause.into(),
        Some(restore) => KeyswapError::Restore { cause, restore },
    }
}
