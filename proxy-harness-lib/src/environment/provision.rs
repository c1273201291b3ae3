use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::cleanup::{Cleanup, Resource};
use super::layout::{create_scratch, ScratchPaths};
use super::{unique_name, Environment, EnvironmentState, ProxyHandle};
use crate::config::HarnessConfig;
use crate::error::{ProvisioningError, ReadinessError};
use crate::runtime::{ContainerRuntime, ContainerSpec, LABEL_ENVIRONMENT, LABEL_ROLE};
use crate::sync::{await_log_line, await_reachable};

/// Lines of proxy log attached to a startup failure
const LOG_TAIL_LINES: usize = 50;

struct Provisioned {
    paths: ScratchPaths,
    proxy: ProxyHandle,
    http_port: u16,
    https_port: u16,
}

/// Provision an environment running the proxy image `image`
///
/// Shorthand for [`Environment::provision`] with `config.proxy.image` replaced.
pub async fn provision(
    runtime: Arc<dyn ContainerRuntime>,
    image: &str,
    config: &HarnessConfig,
) -> Result<Environment, ProvisioningError> {
    let mut config = config.clone();
    config.proxy.image = image.to_string();
    Environment::provision(runtime, &config).await
}

impl Environment {
    /// Create the network, scratch tree and proxy container, then wait for readiness
    ///
    /// Readiness is the configured log line (if any) followed by a TCP connect
    /// to the mapped HTTP port, all within the startup timeout. Anything
    /// created before a failure is released before the error is returned.
    pub async fn provision(
        runtime: Arc<dyn ContainerRuntime>,
        config: &HarnessConfig,
    ) -> Result<Self, ProvisioningError> {
        let id = unique_name(&config.name_prefix);
        let cleanup = Cleanup::new(runtime.clone(), id.clone());
        debug!(environment = %id, state = ?EnvironmentState::Created, "environment allocated");
        info!(
            environment = %id,
            image = %config.proxy.image,
            state = ?EnvironmentState::Provisioning,
            "provisioning environment"
        );

        match setup(runtime.as_ref(), config, &id, &cleanup).await {
            Ok(ready) => {
                info!(
                    environment = %id,
                    http_port = ready.http_port,
                    https_port = ready.https_port,
                    "environment ready"
                );
                Ok(Environment {
                    proxy: ready.proxy,
                    address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    http_port: ready.http_port,
                    https_port: ready.https_port,
                    paths: ready.paths,
                    runtime,
                    backend_policy: config.timeouts.backend_policy(),
                    convergence_policy: config.timeouts.convergence_policy(),
                    config: config.clone(),
                    cleanup,
                    state: Mutex::new(EnvironmentState::Ready),
                    issued: Mutex::new(HashMap::new()),
                    id,
                })
            }
            Err(e) => {
                warn!(
                    environment = %id,
                    error = %e,
                    "provisioning failed, releasing partial environment"
                );
                let report = cleanup.release().await;
                debug!(
                    environment = %id,
                    released = ?report.released,
                    state = ?EnvironmentState::Destroyed,
                    "partial environment released"
                );
                Err(e)
            }
        }
    }
}

async fn setup(
    runtime: &dyn ContainerRuntime,
    config: &HarnessConfig,
    id: &str,
    cleanup: &Cleanup,
) -> Result<Provisioned, ProvisioningError> {
    let proxy = &config.proxy;

    let (dir, paths) =
        create_scratch(config.scratch_root.as_deref(), &format!("{id}-"), proxy)?;
    cleanup.register(Resource::Directory(dir));

    let labels = HashMap::from([(LABEL_ENVIRONMENT.to_string(), id.to_string())]);
    runtime
        .create_network(id, &labels)
        .await
        .map_err(|source| ProvisioningError::Network { network: id.to_string(), source })?;
    cleanup.register(Resource::Network(id.to_string()));

    let name = format!("{id}-proxy");
    let start_err = |source| ProvisioningError::ProxyStart { name: name.clone(), source };
    runtime.ensure_image(&proxy.image).await.map_err(start_err)?;

    let mut proxy_labels = labels.clone();
    proxy_labels.insert(LABEL_ROLE.to_string(), "proxy".to_string());
    let spec = ContainerSpec {
        name: name.clone(),
        image: proxy.image.clone(),
        hostname: None,
        env: proxy.env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
        labels: proxy_labels,
        network: Some(id.to_string()),
        binds: paths.binds(&proxy.docker_socket, &proxy.mounts),
        exposed_ports: Vec::new(),
        published_ports: vec![proxy.http_port, proxy.https_port],
    };
    let container = runtime.run_container(&spec).await.map_err(start_err)?;
    cleanup.register(Resource::Container { id: container.clone(), name: name.clone() });

    let policy = config.timeouts.startup_policy();
    let deadline = policy.start();

    if let Some(needle) = &proxy.readiness_log_line {
        match await_log_line(runtime, &container, needle, &policy).await {
            Ok(waited) => {
                debug!(proxy = %name, waited_ms = waited.as_millis() as u64, "readiness line seen")
            }
            Err(ReadinessError::ContainerExited { exit_code, .. }) => {
                return Err(exited(runtime, &container, &name, exit_code).await);
            }
            Err(e) => return Err(e.into()),
        }
    }

    let state = runtime.inspect(&container).await?;
    if !state.running {
        return Err(exited(runtime, &container, &name, state.exit_code).await);
    }
    let mapped = |port: u16| {
        state
            .host_port(port)
            .ok_or_else(|| ProvisioningError::PortNotPublished { name: name.clone(), port })
    };
    let http_port = mapped(proxy.http_port)?;
    let https_port = mapped(proxy.https_port)?;

    let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), http_port);
    let remaining = policy.clone().with_timeout(deadline.remaining());
    if let Err(e) = await_reachable(address, &remaining).await {
        if let Ok(state) = runtime.inspect(&container).await {
            if !state.running {
                return Err(exited(runtime, &container, &name, state.exit_code).await);
            }
        }
        return Err(e.into());
    }

    Ok(Provisioned {
        paths,
        proxy: ProxyHandle { id: container, name },
        http_port,
        https_port,
    })
}

async fn exited(
    runtime: &dyn ContainerRuntime,
    container: &str,
    name: &str,
    exit_code: Option<i64>,
) -> ProvisioningError {
    let log_tail = runtime
        .logs(container, Some(LOG_TAIL_LINES))
        .await
        .unwrap_or_else(|e| format!("<logs unavailable: {e}>"));
    ProvisioningError::ProxyExited { name: name.to_string(), exit_code, log_tail }
}

