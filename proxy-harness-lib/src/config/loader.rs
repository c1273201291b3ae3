use std::fs;
use std::path::Path;

use crate::config::HarnessConfig;
use crate::error::ConfigError;

/// Environment variable naming a TOML config file
pub const CONFIG_PATH_ENV: &str = "PROXY_HARNESS_CONFIG";
/// Environment variable overriding `proxy.image`
pub const PROXY_IMAGE_ENV: &str = "PROXY_HARNESS_PROXY_IMAGE";
/// Environment variable overriding `backend.image`
pub const BACKEND_IMAGE_ENV: &str = "PROXY_HARNESS_BACKEND_IMAGE";

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<HarnessConfig, ConfigError> {
    let path = p.as_ref();
    let txt = fs::read_to_string(path)
        .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    let cfg: HarnessConfig = toml::from_str(&txt)?;

    validate_config(&cfg)?;

    Ok(cfg)
}

impl HarnessConfig {
    /// Load the file named by `PROXY_HARNESS_CONFIG`, or the defaults, then apply image overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => load_from_path(path)?,
            None => HarnessConfig::default(),
        };

        if let Ok(image) = std::env::var(PROXY_IMAGE_ENV) {
            cfg.proxy.image = image;
        }
        if let Ok(image) = std::env::var(BACKEND_IMAGE_ENV) {
            cfg.backend.image = image;
        }

        validate_config(&cfg)?;
        Ok(cfg)
    }
}

pub fn validate_config(cfg: &HarnessConfig) -> Result<(), ConfigError> {
    if cfg.proxy.image.trim().is_empty() {
        return Err(ConfigError::Invalid("proxy.image must not be empty".to_string()));
    }
    if cfg.backend.image.trim().is_empty() {
        return Err(ConfigError::Invalid("backend.image must not be empty".to_string()));
    }

    if cfg.proxy.http_port == 0 || cfg.proxy.https_port == 0 || cfg.backend.port == 0 {
        return Err(ConfigError::Invalid("ports must be non-zero".to_string()));
    }
    if cfg.proxy.http_port == cfg.proxy.https_port {
        return Err(ConfigError::Invalid(format!(
            "proxy.http_port and proxy.https_port must differ (both {})",
            cfg.proxy.http_port
        )));
    }

    let mounts = &cfg.proxy.mounts;
    for (field, target) in [
        ("tls", &mounts.tls),
        ("config", &mounts.config),
        ("challenge", &mounts.challenge),
        ("docker_socket", &mounts.docker_socket),
    ] {
        if !target.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "proxy.mounts.{field} must be an absolute container path: {target}"
            )));
        }
    }

    if cfg.proxy.baseline_config_name.is_empty() || cfg.proxy.baseline_config_name.contains('/') {
        return Err(ConfigError::Invalid(format!(
            "proxy.baseline_config_name must be a plain file name: {:?}",
            cfg.proxy.baseline_config_name
        )));
    }

    let t = &cfg.timeouts;
    if t.startup_secs == 0 || t.backend_ready_secs == 0 || t.convergence_timeout_secs == 0 {
        return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
    }
    if t.attempt_ms == 0 || t.poll_ms == 0 {
        return Err(ConfigError::Invalid(
            "timeouts.attempt_ms and timeouts.poll_ms must be non-zero".to_string(),
        ));
    }

    let prefix_ok = !cfg.name_prefix.is_empty()
        && cfg.name_prefix.starts_with(|c: char| c.is_ascii_alphanumeric())
        && cfg
            .name_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !prefix_ok {
        return Err(ConfigError::Invalid(format!(
            "name_prefix is not a valid container name prefix: {:?}",
            cfg.name_prefix
        )));
    }

    Ok(())
}
