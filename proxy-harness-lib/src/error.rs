use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors reported by the container runtime
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Runtime error: {0}")]
    Other(String),
}

/// Errors that can occur while loading or validating the harness configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that can occur while producing certificate material
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Invalid hostname for certificate: {0:?}")]
    InvalidHostname(String),

    #[error("Certificate for {hostname} already issued at {path}")]
    AlreadyIssued { hostname: String, path: PathBuf },

    #[error("Key generation failed: {0}")]
    Rcgen(#[from] rcgen::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A dependency never became reachable, or the proxy never converged
#[derive(Error, Debug)]
pub enum ReadinessError {
    #[error("{target} not reachable after {waited:?} ({attempts} attempts): {last_error}")]
    ReadinessTimeout {
        target: String,
        waited: Duration,
        attempts: u32,
        last_error: String,
    },

    #[error("{description} did not converge within {waited:?}; last observation: {last_observation}")]
    ConvergenceTimeout {
        description: String,
        waited: Duration,
        last_observation: String,
    },

    #[error("Log line {needle:?} not seen in container {container} after {waited:?}")]
    LogLineTimeout {
        container: String,
        needle: String,
        waited: Duration,
    },

    #[error("Container {container} exited (code {exit_code:?}) while waiting for readiness")]
    ContainerExited {
        container: String,
        exit_code: Option<i64>,
    },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Errors that can occur while starting a backend container
#[derive(Error, Debug)]
pub enum StartError {
    #[error("Backend {name} exited (code {exit_code:?}) before port {port} accepted connections")]
    CrashedBeforeReady {
        name: String,
        port: u16,
        exit_code: Option<i64>,
    },

    #[error("Backend {name} port {port} not reachable within {waited:?} (last: {last})")]
    TimedOut {
        name: String,
        port: u16,
        waited: Duration,
        last: String,
    },

    #[error("Backend {0} was already removed")]
    Removed(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Errors that can occur while provisioning an environment
#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("Failed to prepare scratch directories: {0}")]
    Scratch(#[from] std::io::Error),

    #[error("Failed to create network {network}: {source}")]
    Network {
        network: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Failed to start proxy container {name}: {source}")]
    ProxyStart {
        name: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Proxy container {name} exited (code {exit_code:?}) during startup; log tail:\n{log_tail}")]
    ProxyExited {
        name: String,
        exit_code: Option<i64>,
        log_tail: String,
    },

    #[error("Proxy container {name} does not publish container port {port}")]
    PortNotPublished { name: String, port: u16 },

    #[error("Proxy not ready: {0}")]
    Readiness(#[from] ReadinessError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Errors surfaced by probe clients
///
/// Often the expected outcome of a probe, so callers match on the variant.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Connection refused by {0}")]
    ConnectionRefused(String),

    #[error("Probe to {0} timed out")]
    Timeout(String),

    #[error("TLS handshake with {target} failed: {reason}")]
    Tls { target: String, reason: String },

    #[error("WebSocket upgrade rejected with status {status}")]
    HandshakeRejected {
        status: http::StatusCode,
        headers: http::HeaderMap,
        body: bytes::Bytes,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid probe request: {0}")]
    InvalidRequest(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    /// Status code that accompanied a rejected WebSocket upgrade
    pub fn rejection_status(&self) -> Option<http::StatusCode> {
        match self {
            ProbeError::HandshakeRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Top-level error for harness operations
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Assertion(#[from] crate::assertions::AssertionFailure),

    #[error(transparent)]
    AssertionReport(#[from] crate::assertions::AssertionReport),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type Result<T> = std::result::Result<T, HarnessError>;
