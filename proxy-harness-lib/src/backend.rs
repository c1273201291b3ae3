//! Backend container factory
//!
//! Backends are routing targets started on an environment's network. The
//! scenario owns them: it stops or removes them to trigger proxy
//! reconfiguration, and whatever is left is swept when the environment is
//! released.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::declare::BackendEnv;
use crate::environment::{unique_suffix, Environment};
use crate::error::{RuntimeError, StartError};
use crate::runtime::{ContainerRuntime, ContainerSpec, LABEL_ENVIRONMENT, LABEL_ROLE};
use crate::sync::{poll_until, Attempt, PollFailure, RetryPolicy};

/// Grace period for `docker stop` before the container is killed
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Observable lifecycle of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Requested,
    Starting,
    Listening,
    Stopped,
    Removed,
}

/// What to start: image, declaration variables and the port it listens on
#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub image: String,
    pub env: Vec<String>,
    pub port: u16,
    pub hostname: Option<String>,
}

impl BackendSpec {
    pub fn new(image: impl Into<String>, port: u16) -> Self {
        Self { image: image.into(), env: Vec::new(), port, hostname: None }
    }

    /// Default backend image and port from configuration
    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(config.image.clone(), config.port)
    }

    pub fn env(mut self, env: impl Into<Vec<String>>) -> Self {
        self.env.extend(env.into());
        self
    }

    pub fn declare(self, declarations: BackendEnv) -> Self {
        self.env(declarations.into_vars())
    }

    /// Container hostname; echo servers report it, which makes a handy marker
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }
}

/// A running (or stopped) backend container
pub struct Backend {
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    name: String,
    hostname: String,
    network: String,
    port: u16,
    env: Vec<String>,
    address: Option<IpAddr>,
    state: BackendState,
    policy: RetryPolicy,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("network", &self.network)
            .field("port", &self.port)
            .field("address", &self.address)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

enum Stop {
    Pending(String),
    NoAddress,
    Exited(Option<i64>),
    Runtime(RuntimeError),
}

/// Start a backend on `environment`'s network and wait until its port accepts connections
///
/// A backend that fails to become ready is removed before the error is returned.
pub async fn start(environment: &Environment, spec: BackendSpec) -> Result<Backend, StartError> {
    let runtime = environment.runtime().clone();
    let name = format!("{}-backend-{}", environment.id(), unique_suffix());
    let hostname = spec.hostname.clone().unwrap_or_else(|| name.clone());

    let labels = HashMap::from([
        (LABEL_ENVIRONMENT.to_string(), environment.id().to_string()),
        (LABEL_ROLE.to_string(), "backend".to_string()),
    ]);
    let container = ContainerSpec {
        name: name.clone(),
        image: spec.image.clone(),
        hostname: Some(hostname.clone()),
        env: spec.env.clone(),
        labels,
        network: Some(environment.network().to_string()),
        exposed_ports: vec![spec.port],
        ..Default::default()
    };

    debug!(backend = %name, image = %spec.image, env = ?spec.env, "starting backend");
    environment.mark_in_use();
    runtime.ensure_image(&spec.image).await?;
    let id = runtime.run_container(&container).await?;

    let mut backend = Backend {
        runtime,
        id,
        name,
        hostname,
        network: environment.network().to_string(),
        port: spec.port,
        env: spec.env,
        address: None,
        state: BackendState::Starting,
        policy: environment.backend_policy().clone(),
    };

    match backend.await_listening().await {
        Ok(()) => {
            info!(
                backend = %backend.name,
                address = ?backend.address,
                port = backend.port,
                "backend listening"
            );
            Ok(backend)
        }
        Err(e) => {
            warn!(backend = %backend.name, error = %e, "backend failed to become ready, removing");
            if let Err(remove_err) = backend.remove().await {
                warn!(backend = %backend.name, error = %remove_err, "failed to remove backend");
            }
            Err(e)
        }
    }
}

impl Backend {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Container hostname, reported by echo-style backends in their responses
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    /// Address on the environment network, known once listening
    pub fn address(&self) -> Option<IpAddr> {
        self.address
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address.map(|ip| SocketAddr::new(ip, self.port))
    }

    /// `KEY=VALUE` declarations the backend was started with
    pub fn declarations(&self) -> &[String] {
        &self.env
    }

    async fn await_listening(&mut self) -> Result<(), StartError> {
        self.state = BackendState::Starting;
        let runtime = self.runtime.as_ref();
        let (id, network, port) = (self.id.as_str(), self.network.as_str(), self.port);
        let attempt_timeout = self.policy.attempt_timeout;
        let deadline = self.policy.start();

        let result = poll_until(&self.policy, || async move {
            let state = runtime.inspect(id).await.map_err(|e| Attempt::Break(Stop::Runtime(e)))?;
            if !state.running {
                return Err(Attempt::Break(Stop::Exited(state.exit_code)));
            }
            let ip = state.address_on(network).ok_or(Attempt::Retry(Stop::NoAddress))?;
            let addr = SocketAddr::new(ip, port);
            match tokio::time::timeout(attempt_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_stream)) => Ok(ip),
                Ok(Err(e)) => Err(Attempt::Retry(Stop::Pending(e.to_string()))),
                Err(_) => Err(Attempt::Retry(Stop::Pending("connect timed out".to_string()))),
            }
        })
        .await;

        match result {
            Ok(ip) => {
                self.address = Some(ip);
                self.state = BackendState::Listening;
                Ok(())
            }
            Err(PollFailure::Exhausted(ex)) => {
                let last = match ex.last {
                    Some(Stop::NoAddress) => format!("no address on network {}", self.network),
                    Some(Stop::Pending(reason)) => reason,
                    _ => "no attempt completed".to_string(),
                };
                debug!(backend = %self.name, %last, attempts = ex.attempts, "backend wait expired");
                Err(StartError::TimedOut {
                    name: self.name.clone(),
                    port: self.port,
                    waited: ex.waited,
                    last,
                })
            }
            Err(PollFailure::Aborted(Stop::Exited(exit_code))) => {
                self.state = BackendState::Stopped;
                Err(StartError::CrashedBeforeReady {
                    name: self.name.clone(),
                    port: self.port,
                    exit_code,
                })
            }
            Err(PollFailure::Aborted(Stop::Runtime(e))) => Err(StartError::Runtime(e)),
            Err(PollFailure::Aborted(_)) => Err(StartError::TimedOut {
                name: self.name.clone(),
                port: self.port,
                waited: deadline.elapsed(),
                last: "wait aborted".to_string(),
            }),
        }
    }

    fn ensure_present(&self) -> Result<(), StartError> {
        if self.state == BackendState::Removed {
            return Err(StartError::Removed(self.name.clone()));
        }
        Ok(())
    }

    /// Stop the container; the proxy should drop its routes
    pub async fn stop(&mut self) -> Result<(), StartError> {
        self.ensure_present()?;
        self.runtime.stop_container(&self.id, STOP_GRACE).await?;
        self.state = BackendState::Stopped;
        info!(backend = %self.name, "backend stopped");
        Ok(())
    }

    /// Start a stopped container and wait for its port again
    pub async fn start(&mut self) -> Result<(), StartError> {
        self.ensure_present()?;
        self.runtime.start_container(&self.id).await?;
        self.await_listening().await?;
        info!(backend = %self.name, address = ?self.address, "backend restarted");
        Ok(())
    }

    pub async fn restart(&mut self) -> Result<(), StartError> {
        self.ensure_present()?;
        self.runtime.restart_container(&self.id).await?;
        self.await_listening().await
    }

    /// Force-remove the container; calling it again is a no-op
    pub async fn remove(&mut self) -> Result<(), StartError> {
        if self.state == BackendState::Removed {
            return Ok(());
        }
        match self.runtime.remove_container(&self.id).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.state = BackendState::Removed;
        self.address = None;
        info!(backend = %self.name, "backend removed");
        Ok(())
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        if self.state != BackendState::Removed {
            warn!(
                backend = %self.name,
                state = ?self.state,
                "backend dropped without removal; it is swept when its environment is released"
            );
        }
    }
}
