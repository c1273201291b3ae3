use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::info;

use crate::error::GenerationError;

/// Subdirectory of the TLS store holding certificates
pub const CERTS_DIR: &str = "certs";
/// Subdirectory of the TLS store holding private keys
pub const PRIVATE_DIR: &str = "private";

/// Validity of issued certificates
pub const VALIDITY: time::Duration = time::Duration::days(365);

/// Self-signed material issued for one hostname
#[derive(Debug, Clone)]
pub struct CertificateRecord {
    pub hostname: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

fn valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Accepts DNS names, optionally with a leading `*.` wildcard label
pub fn validate_hostname(hostname: &str) -> Result<(), GenerationError> {
    let rest = hostname.strip_prefix("*.").unwrap_or(hostname);
    if hostname.len() > 253 || !rest.split('.').all(valid_label) {
        return Err(GenerationError::InvalidHostname(hostname.to_string()));
    }
    Ok(())
}

/// File stem used for `hostname`'s certificate and key
///
/// `*.example.com` maps to `_wildcard.example.com`.
pub fn file_stem(hostname: &str) -> String {
    let lower = hostname.to_ascii_lowercase();
    match lower.strip_prefix("*.") {
        Some(rest) => format!("_wildcard.{rest}"),
        None => lower,
    }
}

/// Paths `issue` writes for `hostname` under `directory`
pub fn material_paths(directory: &Path, hostname: &str) -> (PathBuf, PathBuf) {
    let stem = file_stem(hostname);
    (
        directory.join(CERTS_DIR).join(format!("{stem}.crt")),
        directory.join(PRIVATE_DIR).join(format!("{stem}.key")),
    )
}

fn create_exclusive(path: &Path, hostname: &str) -> Result<File, GenerationError> {
    OpenOptions::new().write(true).create_new(true).open(path).map_err(|e| {
        if e.kind() == ErrorKind::AlreadyExists {
            GenerationError::AlreadyIssued {
                hostname: hostname.to_string(),
                path: path.to_path_buf(),
            }
        } else {
            GenerationError::Io(e)
        }
    })
}

fn write_material(
    hostname: &str,
    cert_file: &mut File,
    key_file: &mut File,
) -> Result<(OffsetDateTime, OffsetDateTime), GenerationError> {
    let key_pair = KeyPair::generate()?;

    let mut params = CertificateParams::new(vec![hostname.to_string()])?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;
    let not_before = OffsetDateTime::now_utc();
    let not_after = not_before + VALIDITY;
    params.not_before = not_before;
    params.not_after = not_after;

    let cert = params.self_signed(&key_pair)?;
    cert_file.write_all(cert.pem().as_bytes())?;
    key_file.write_all(key_pair.serialize_pem().as_bytes())?;
    cert_file.sync_all()?;
    key_file.sync_all()?;
    Ok((not_before, not_after))
}

/// Issue a self-signed certificate for `hostname` into the TLS store `directory`
///
/// The hostname is both the subject CN and the only DNS SAN; the certificate is
/// valid from now for one year. Issuing twice for the same hostname in the same
/// store fails with `AlreadyIssued` and leaves the first material untouched.
pub fn issue(directory: &Path, hostname: &str) -> Result<CertificateRecord, GenerationError> {
    validate_hostname(hostname)?;

    let (cert_path, key_path) = material_paths(directory, hostname);
    fs::create_dir_all(directory.join(CERTS_DIR))?;
    fs::create_dir_all(directory.join(PRIVATE_DIR))?;

    let mut cert_file = create_exclusive(&cert_path, hostname)?;
    let mut key_file = match create_exclusive(&key_path, hostname) {
        Ok(f) => f,
        Err(e) => {
            drop(cert_file);
            let _ = fs::remove_file(&cert_path);
            return Err(e);
        }
    };

    let written = write_material(hostname, &mut cert_file, &mut key_file);
    let (not_before, not_after) = match written {
        Ok(window) => window,
        Err(e) => {
            let _ = fs::remove_file(&cert_path);
            let _ = fs::remove_file(&key_path);
            return Err(e);
        }
    };

    info!(hostname, cert = %cert_path.display(), "Issued self-signed certificate");

    Ok(CertificateRecord {
        hostname: hostname.to_string(),
        cert_path,
        key_path,
        not_before,
        not_after,
    })
}
