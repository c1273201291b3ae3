//! E2E test helpers and common utilities
//!
//! Every scenario provisions its own environment, so tests in this crate run
//! in parallel against one Docker daemon.

use std::sync::Arc;

use proxy_harness_lib::error::{ProbeError, ReadinessError, StartError};
use proxy_harness_lib::probe::{http_get, https_get, ProbeRequest, ProbeResponse};
use proxy_harness_lib::{
    init_tracing, Backend, BackendEnv, BackendSpec, ContainerRuntime, DockerRuntime, Environment,
    HarnessConfig,
};
use tracing::info;

/// Text the echo backend puts in every response before its hostname
pub const MARKER_PREFIX: &str = "Request served by";

/// Connect to the Docker daemon and load the harness configuration
///
/// The configuration comes from `PROXY_HARNESS_CONFIG` when set, otherwise
/// defaults; `PROXY_HARNESS_PROXY_IMAGE` overrides the proxy image.
pub async fn harness(
) -> Result<(Arc<dyn ContainerRuntime>, HarnessConfig), Box<dyn std::error::Error + Send + Sync>> {
    let config = HarnessConfig::from_env()?;
    init_tracing(&config.logging);

    let runtime = DockerRuntime::connect()
        .await
        .map_err(|e| format!("Failed to connect to Docker: {e}"))?;
    runtime.ping().await.map_err(|e| format!("Docker daemon not responding: {e}"))?;
    info!(image = %config.proxy.image, "harness ready");
    Ok((Arc::new(runtime), config))
}

/// Start the configured echo backend with `declarations`
pub async fn start_echo(
    env: &Environment,
    declarations: BackendEnv,
) -> Result<Backend, StartError> {
    let spec = BackendSpec::from_config(&env.config().backend).declare(declarations);
    env.start_backend(spec).await
}

/// The string a response from `backend` is expected to contain
pub fn marker(backend: &Backend) -> String {
    format!("{MARKER_PREFIX} {}", backend.hostname())
}

#[derive(Debug, Clone, Copy)]
pub enum Transport {
    Http,
    Https,
}

async fn probe(
    env: &Environment,
    transport: Transport,
    request: &ProbeRequest,
) -> Result<ProbeResponse, ProbeError> {
    match transport {
        Transport::Http => http_get(&env.http_target(), request).await,
        Transport::Https => https_get(&env.https_target(), request).await,
    }
}

/// Probe until the response status is `status`, within the convergence policy
///
/// The proxy regenerates its configuration asynchronously after container
/// events, so a freshly declared route may answer 503 for a moment.
pub async fn expect_status(
    env: &Environment,
    transport: Transport,
    request: &ProbeRequest,
    status: u16,
) -> Result<ProbeResponse, ReadinessError> {
    let description =
        format!("{}{}{} returns {status}", label(transport), request.host, request.path);
    env.eventually(&description, || async move {
        let response = probe(env, transport, request).await.map_err(|e| e.to_string())?;
        if response.status.as_u16() == status {
            Ok(response)
        } else {
            Err(format!("got {} with body {:?}", response.status, response.text()))
        }
    })
    .await
}

fn label(transport: Transport) -> &'static str {
    match transport {
        Transport::Http => "GET http://",
        Transport::Https => "GET https://",
    }
}

