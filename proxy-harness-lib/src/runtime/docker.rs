//! Docker implementation of [`ContainerRuntime`] on top of bollard

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ContainerRuntime, ContainerSpec, ContainerState};
use crate::error::RuntimeError;

/// Container runtime backed by the local Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect with the local defaults (`DOCKER_HOST` or the unix socket) and ping the daemon
    pub async fn connect() -> Result<Self, RuntimeError> {
        let runtime = Self::from_docker(Docker::connect_with_local_defaults()?);
        runtime.ping().await?;
        info!("Connected to Docker daemon");
        Ok(runtime)
    }

    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }
}

fn classify(subject: &str, err: DockerError) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError { status_code: 404, .. } => {
            RuntimeError::NotFound(subject.to_string())
        }
        other => RuntimeError::Docker(other),
    }
}

fn is_not_modified(err: &DockerError) -> bool {
    matches!(err, DockerError::DockerResponseServerError { status_code: 304, .. })
}

fn label_filter(label: &str) -> HashMap<String, Vec<String>> {
    HashMap::from([("label".to_string(), vec![label.to_string()])])
}

fn tcp_key(port: u16) -> String {
    format!("{port}/tcp")
}

fn parse_tcp_key(key: &str) -> Option<u16> {
    key.strip_suffix("/tcp")?.parse().ok()
}

pub(crate) fn state_from_inspect(inspect: &ContainerInspectResponse) -> ContainerState {
    let (running, exit_code) = inspect
        .state
        .as_ref()
        .map(|s| (s.running.unwrap_or(false), s.exit_code))
        .unwrap_or((false, None));

    let networks = inspect
        .network_settings
        .as_ref()
        .and_then(|ns| ns.networks.as_ref())
        .map(|nets| {
            nets.iter()
                .filter_map(|(name, endpoint)| {
                    let ip = endpoint.ip_address.as_deref().filter(|ip| !ip.is_empty())?;
                    ip.parse::<IpAddr>().ok().map(|ip| (name.clone(), ip))
                })
                .collect()
        })
        .unwrap_or_default();

    let published_ports = inspect
        .network_settings
        .as_ref()
        .and_then(|ns| ns.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .filter_map(|(key, bindings)| {
                    let container_port = parse_tcp_key(key)?;
                    let host_port = bindings
                        .as_ref()?
                        .iter()
                        .find_map(|b| b.host_port.as_deref()?.parse::<u16>().ok())?;
                    Some((container_port, host_port))
                })
                .collect()
        })
        .unwrap_or_default();

    ContainerState { running, exit_code, networks, published_ports }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mut exposed: HashMap<String, HashMap<(), ()>> = spec
        .exposed_ports
        .iter()
        .map(|port| (tcp_key(*port), HashMap::new()))
        .collect();

    let mut port_bindings = HashMap::new();
    for port in &spec.published_ports {
        exposed.insert(tcp_key(*port), HashMap::new());
        port_bindings.insert(
            tcp_key(*port),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                // dynamic host port
                host_port: None,
            }]),
        );
    }

    let host_config = HostConfig {
        network_mode: spec.network.clone(),
        binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        hostname: spec.hostname.clone(),
        env: Some(spec.env.clone()),
        labels: Some(spec.labels.clone()),
        exposed_ports: (!exposed.is_empty()).then_some(exposed),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map(|_| ()).map_err(RuntimeError::from)
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => {
                debug!(image, "image present");
                return Ok(());
            }
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => {}
            Err(e) => return Err(RuntimeError::Docker(e)),
        }

        info!(image, "Pulling image");
        let options = CreateImageOptions { from_image: image.to_string(), ..Default::default() };
        let mut stream = Box::pin(self.docker.create_image(Some(options), None, None));
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(|e| classify(image, e))?;
            if let Some(status) = progress.status {
                debug!(image, status = %status, "pull progress");
            }
        }
        info!(image, "Image pulled");
        Ok(())
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            labels: labels.clone(),
            ..Default::default()
        };
        self.docker.create_network(options).await.map_err(RuntimeError::from)?;
        info!(network = %name, "Created network");
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker.remove_network(name).await.map_err(|e| classify(name, e))?;
        debug!(network = %name, "Removed network");
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions { name: spec.name.clone(), platform: None };
        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| classify(&spec.image, e))?;
        for warning in &response.warnings {
            warn!(container = %spec.name, %warning, "container create warning");
        }

        if let Err(e) = self
            .docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
        {
            warn!(container = %spec.name, error = %e, "start failed, removing container");
            let _ = self.remove_container(&response.id).await;
            return Err(classify(&spec.name, e));
        }

        info!(container = %spec.name, id = %response.id, image = %spec.image, "Started container");
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        match self.docker.start_container(id, None::<StartContainerOptions<String>>).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(classify(id, e)),
        }
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions { t: grace.as_secs() as i64 };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(classify(id, e)),
        }
    }

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .restart_container(id, None::<RestartContainerOptions>)
            .await
            .map_err(|e| classify(id, e))
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions { force: true, v: true, ..Default::default() };
        self.docker.remove_container(id, Some(options)).await.map_err(|e| classify(id, e))
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(id, e))?;
        Ok(state_from_inspect(&inspect))
    }

    async fn logs(&self, id: &str, tail: Option<usize>) -> Result<String, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.map(|n| n.to_string()).unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };
        let mut stream = Box::pin(self.docker.logs(id, Some(options)));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify(id, e))?;
            out.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(out)
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<String>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: label_filter(label),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn list_networks(&self, label: &str) -> Result<Vec<String>, RuntimeError> {
        let options = ListNetworksOptions::<String> { filters: label_filter(label) };
        let networks = self.docker.list_networks(Some(options)).await?;
        Ok(networks.into_iter().filter_map(|n| n.name).collect())
    }
}
