use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::sync::{Backoff, RetryPolicy};

/// Container paths the scratch directories are mounted at inside the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct MountConfig {
    /// TLS store root; holds `certs/` and `private/`
    /// Default: "/etc/nginx/ssl"
    #[serde(default = "default_tls_mount")]
    pub tls: String,
    /// Proxy configuration directory (baseline config + include dir)
    /// Default: "/etc/nginx/conf.d"
    #[serde(default = "default_config_mount")]
    pub config: String,
    /// Domain-validation challenge directory
    /// Default: "/var/www/challenges"
    #[serde(default = "default_challenge_mount")]
    pub challenge: String,
    /// Where the container-runtime socket appears inside the proxy
    /// Default: "/var/run/docker.sock"
    #[serde(default = "default_socket_mount")]
    pub docker_socket: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            tls: default_tls_mount(),
            config: default_config_mount(),
            challenge: default_challenge_mount(),
            docker_socket: default_socket_mount(),
        }
    }
}

/// Proxy-under-test configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Image reference of the proxy under test
    /// Overridden by `PROXY_HARNESS_PROXY_IMAGE` when loaded via `from_env`
    #[serde(default = "default_proxy_image")]
    pub image: String,
    /// Container port serving plain HTTP
    /// Default: 80
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Container port serving HTTPS
    /// Default: 443
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    /// Log line the proxy prints once it is up (optional)
    /// When unset, readiness is a TCP connect to the mapped HTTP port only
    #[serde(default)]
    pub readiness_log_line: Option<String>,
    /// Host path of the container-runtime socket mounted into the proxy
    /// Default: "/var/run/docker.sock"
    #[serde(default = "default_socket_mount")]
    pub docker_socket: String,
    /// Mount targets inside the proxy container
    #[serde(default)]
    pub mounts: MountConfig,
    /// Extra environment variables for the proxy container
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// File name of the baseline config written into the config directory
    /// Default: "default.conf"
    #[serde(default = "default_baseline_name")]
    pub baseline_config_name: String,
    /// Contents of the baseline config
    /// Default: a comment plus an include of the fragments directory
    #[serde(default)]
    pub baseline_config: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            image: default_proxy_image(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            readiness_log_line: None,
            docker_socket: default_socket_mount(),
            mounts: MountConfig::default(),
            env: BTreeMap::new(),
            baseline_config_name: default_baseline_name(),
            baseline_config: None,
        }
    }
}

impl ProxyConfig {
    /// Baseline config contents, falling back to the built-in default
    pub fn baseline_contents(&self) -> String {
        match &self.baseline_config {
            Some(contents) => contents.clone(),
            None => format!(
                "# baseline configuration written by proxy-harness\ninclude {}/{}/*.conf;\n",
                self.mounts.config.trim_end_matches('/'),
                crate::environment::INCLUDE_DIR
            ),
        }
    }
}

/// Default backend image used by scenarios
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Image reference of the routing target
    /// Default: "jmalloc/echo-server:latest"
    #[serde(default = "default_backend_image")]
    pub image: String,
    /// Port the backend listens on
    /// Default: 8080
    #[serde(default = "default_backend_port")]
    pub port: u16,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { image: default_backend_image(), port: default_backend_port() }
    }
}

/// Timeout and polling configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    /// Deadline for proxy startup in seconds
    /// Default: 60
    #[serde(default = "default_startup_secs")]
    pub startup_secs: u64,
    /// Deadline for a backend port to accept connections in seconds
    /// Default: 30
    #[serde(default = "default_backend_ready_secs")]
    pub backend_ready_secs: u64,
    /// Timeout of a single connect attempt in milliseconds
    /// Default: 500
    #[serde(default = "default_attempt_ms")]
    pub attempt_ms: u64,
    /// Interval between attempts in milliseconds
    /// Default: 250
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    /// Pause after a successful connect in milliseconds
    /// Default: 500
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Fixed grace after a registration-affecting event in milliseconds
    /// Default: 2000
    #[serde(default = "default_convergence_ms")]
    pub convergence_ms: u64,
    /// Deadline for polled convergence checks in seconds
    /// Default: 20
    #[serde(default = "default_convergence_timeout_secs")]
    pub convergence_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup_secs: default_startup_secs(),
            backend_ready_secs: default_backend_ready_secs(),
            attempt_ms: default_attempt_ms(),
            poll_ms: default_poll_ms(),
            settle_ms: default_settle_ms(),
            convergence_ms: default_convergence_ms(),
            convergence_timeout_secs: default_convergence_timeout_secs(),
        }
    }
}

impl TimeoutConfig {
    fn policy(&self, timeout: Duration, backoff: Backoff) -> RetryPolicy {
        RetryPolicy {
            timeout,
            interval: Duration::from_millis(self.poll_ms),
            attempt_timeout: Duration::from_millis(self.attempt_ms),
            settle: Duration::from_millis(self.settle_ms),
            backoff,
        }
    }

    /// Policy bounding proxy startup
    pub fn startup_policy(&self) -> RetryPolicy {
        self.policy(Duration::from_secs(self.startup_secs), Backoff::Fixed)
    }

    /// Policy bounding backend port readiness
    pub fn backend_policy(&self) -> RetryPolicy {
        self.policy(Duration::from_secs(self.backend_ready_secs), Backoff::Fixed)
    }

    /// Policy for polled convergence checks; backs off up to 2s between probes
    pub fn convergence_policy(&self) -> RetryPolicy {
        self.policy(
            Duration::from_secs(self.convergence_timeout_secs),
            Backoff::Exponential { multiplier: 1.5, max_interval: Duration::from_secs(2) },
        )
    }

    pub fn convergence_grace(&self) -> Duration {
        Duration::from_millis(self.convergence_ms)
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    /// Default: "info"
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Show module path (target) in log messages
    /// Default: false
    #[serde(default)]
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), show_target: false }
    }
}

/// Main harness configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HarnessConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Parent directory for per-environment scratch trees
    /// Default: the system temp dir
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,
    /// Prefix for generated network and container names
    /// Default: "proxy-harness"
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            backend: BackendConfig::default(),
            timeouts: TimeoutConfig::default(),
            logging: LoggingConfig::default(),
            scratch_root: None,
            name_prefix: default_name_prefix(),
        }
    }
}

fn default_tls_mount() -> String {
    "/etc/nginx/ssl".to_string()
}

fn default_config_mount() -> String {
    "/etc/nginx/conf.d".to_string()
}

fn default_challenge_mount() -> String {
    "/var/www/challenges".to_string()
}

fn default_socket_mount() -> String {
    "/var/run/docker.sock".to_string()
}

fn default_proxy_image() -> String {
    "vhost-proxy:latest".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_baseline_name() -> String {
    "default.conf".to_string()
}

fn default_backend_image() -> String {
    "jmalloc/echo-server:latest".to_string()
}

fn default_backend_port() -> u16 {
    8080
}

fn default_startup_secs() -> u64 {
    60
}

fn default_backend_ready_secs() -> u64 {
    30
}

fn default_attempt_ms() -> u64 {
    500
}

fn default_poll_ms() -> u64 {
    250
}

fn default_settle_ms() -> u64 {
    500
}

fn default_convergence_ms() -> u64 {
    2000
}

fn default_convergence_timeout_secs() -> u64 {
    20
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_name_prefix() -> String {
    "proxy-harness".to_string()
}
