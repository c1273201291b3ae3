use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::config::{MountConfig, ProxyConfig};
use crate::tls::{CERTS_DIR, PRIVATE_DIR};

/// Include directory for generated per-host fragments, inside the config dir
pub const INCLUDE_DIR: &str = "includes";

const TLS_DIR: &str = "tls";
const CONFIG_DIR: &str = "config";
const CHALLENGE_DIR: &str = "challenge";

/// Host-side scratch directories mounted into the proxy
#[derive(Debug, Clone)]
pub struct ScratchPaths {
    pub root: PathBuf,
    /// TLS store; holds `certs/` and `private/`
    pub tls: PathBuf,
    pub config: PathBuf,
    pub includes: PathBuf,
    pub challenge: PathBuf,
}

impl ScratchPaths {
    /// Bind mount entries, `host:container[:mode]`
    pub fn binds(&self, docker_socket: &str, mounts: &MountConfig) -> Vec<String> {
        vec![
            format!("{docker_socket}:{}:ro", mounts.docker_socket),
            format!("{}:{}", self.tls.display(), mounts.tls),
            format!("{}:{}", self.config.display(), mounts.config),
            format!("{}:{}", self.challenge.display(), mounts.challenge),
        ]
    }
}

/// Create the scratch tree for one environment
///
/// The returned `TempDir` owns the tree: dropping it deletes everything.
pub(crate) fn create_scratch(
    scratch_root: Option<&Path>,
    prefix: &str,
    proxy: &ProxyConfig,
) -> io::Result<(TempDir, ScratchPaths)> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix);
    let dir = match scratch_root {
        Some(root) => {
            fs::create_dir_all(root)?;
            builder.tempdir_in(root)?
        }
        None => builder.tempdir()?,
    };

    let root = dir.path().to_path_buf();
    let paths = ScratchPaths {
        tls: root.join(TLS_DIR),
        config: root.join(CONFIG_DIR),
        includes: root.join(CONFIG_DIR).join(INCLUDE_DIR),
        challenge: root.join(CHALLENGE_DIR),
        root,
    };

    fs::create_dir_all(paths.tls.join(CERTS_DIR))?;
    fs::create_dir_all(paths.tls.join(PRIVATE_DIR))?;
    fs::create_dir_all(&paths.includes)?;
    fs::create_dir_all(&paths.challenge)?;
    fs::write(paths.config.join(&proxy.baseline_config_name), proxy.baseline_contents())?;

    Ok((dir, paths))
}
