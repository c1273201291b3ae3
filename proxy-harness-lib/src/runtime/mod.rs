//! Container-runtime seam
//!
//! Everything the harness does to containers and networks goes through
//! [`ContainerRuntime`]. The Docker implementation lives in [`docker`]; tests
//! substitute a recording fake.

pub mod docker;

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::RuntimeError;

pub use docker::DockerRuntime;

/// Label carrying the owning environment id
pub const LABEL_ENVIRONMENT: &str = "proxy-harness.environment";
/// Label carrying the container role ("proxy" or "backend")
pub const LABEL_ROLE: &str = "proxy-harness.role";

/// Everything needed to create and start one container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    /// `KEY=VALUE` entries
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Network the container is attached to at creation
    pub network: Option<String>,
    /// Bind mounts, `host:container[:mode]`
    pub binds: Vec<String>,
    /// TCP ports exposed on the container network
    pub exposed_ports: Vec<u16>,
    /// TCP ports published to a dynamic port on 127.0.0.1
    pub published_ports: Vec<u16>,
}

/// Observed state of a container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerState {
    pub running: bool,
    pub exit_code: Option<i64>,
    /// Address per attached network
    pub networks: HashMap<String, IpAddr>,
    /// Container port -> host port
    pub published_ports: HashMap<u16, u16>,
}

impl ContainerState {
    pub fn address_on(&self, network: &str) -> Option<IpAddr> {
        self.networks.get(network).copied()
    }

    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.published_ports.get(&container_port).copied()
    }
}

/// Operations the harness needs from a container runtime
///
/// Implementations must tolerate concurrent use by independent environments.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Make `image` available locally, pulling it if missing
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    async fn create_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), RuntimeError>;

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError>;

    /// Create and start a container; returns its id
    ///
    /// A container that was created but failed to start is removed again.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force-remove a container (running or not) and its anonymous volumes
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError>;

    /// Combined stdout/stderr; `tail` limits to the last n lines
    async fn logs(&self, id: &str, tail: Option<usize>) -> Result<String, RuntimeError>;

    /// Ids of containers (any state) carrying `label` (`key` or `key=value`)
    async fn list_containers(&self, label: &str) -> Result<Vec<String>, RuntimeError>;

    /// Names of networks carrying `label` (`key` or `key=value`)
    async fn list_networks(&self, label: &str) -> Result<Vec<String>, RuntimeError>;
}
