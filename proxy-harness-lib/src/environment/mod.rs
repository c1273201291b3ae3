//! Ephemeral proxy environments
//!
//! An [`Environment`] is one isolated network, one proxy container and the
//! scratch directories mounted into it. It is created by
//! [`Environment::provision`] and given back by [`Environment::release`] (or
//! [`with_environment`], which does both around a scenario).

mod cleanup;
mod layout;
mod provision;
mod scope;

pub use cleanup::{sweep_orphans, CleanupReport};
pub use layout::{ScratchPaths, INCLUDE_DIR};
pub use provision::provision;
pub use scope::with_environment;

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{self, Backend, BackendSpec};
use crate::config::HarnessConfig;
use crate::error::{GenerationError, ReadinessError, RuntimeError, StartError};
use crate::probe::ProbeTarget;
use crate::runtime::ContainerRuntime;
use crate::sync::{self, RetryPolicy};
use crate::tls::{self, CertificateRecord};

use cleanup::{release_all, Cleanup};

static ENVIRONMENT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Eight random hex characters
pub(crate) fn unique_suffix() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Process-unique environment id: `<prefix>-<pid>-<counter>-<random>`
pub(crate) fn unique_name(prefix: &str) -> String {
    let n = ENVIRONMENT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{n}-{}", std::process::id(), unique_suffix())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentState {
    Created,
    Provisioning,
    Ready,
    InUse,
    TearingDown,
    Destroyed,
}

/// Handle to the proxy container of an environment
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    pub id: String,
    pub name: String,
}

pub struct Environment {
    id: String,
    proxy: ProxyHandle,
    address: IpAddr,
    http_port: u16,
    https_port: u16,
    paths: ScratchPaths,
    runtime: Arc<dyn ContainerRuntime>,
    config: HarnessConfig,
    backend_policy: RetryPolicy,
    convergence_policy: RetryPolicy,
    cleanup: Cleanup,
    state: Mutex<EnvironmentState>,
    issued: Mutex<HashMap<String, CertificateRecord>>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.id)
            .field("proxy", &self.proxy)
            .field("address", &self.address)
            .field("http_port", &self.http_port)
            .field("https_port", &self.https_port)
            .field("state", &self.state())
            .field("pending_resources", &self.cleanup.pending())
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Environment id; also the name of its network
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn network(&self) -> &str {
        &self.id
    }

    pub fn proxy(&self) -> &ProxyHandle {
        &self.proxy
    }

    /// Externally reachable address of the proxy
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Host port mapped to the proxy's HTTP port
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Host port mapped to the proxy's HTTPS port
    pub fn https_port(&self) -> u16 {
        self.https_port
    }

    pub fn http_target(&self) -> ProbeTarget {
        ProbeTarget::new(self.address, self.http_port)
    }

    pub fn https_target(&self) -> ProbeTarget {
        ProbeTarget::new(self.address, self.https_port)
    }

    pub fn paths(&self) -> &ScratchPaths {
        &self.paths
    }

    pub fn tls_dir(&self) -> &Path {
        &self.paths.tls
    }

    pub fn config_dir(&self) -> &Path {
        &self.paths.config
    }

    pub fn challenge_dir(&self) -> &Path {
        &self.paths.challenge
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn backend_policy(&self) -> &RetryPolicy {
        &self.backend_policy
    }

    pub fn convergence_policy(&self) -> &RetryPolicy {
        &self.convergence_policy
    }

    pub fn state(&self) -> EnvironmentState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: EnvironmentState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(environment = %self.id, from = ?*state, to = ?next, "state change");
        *state = next;
    }

    pub(crate) fn mark_in_use(&self) {
        if self.state() == EnvironmentState::Ready {
            self.set_state(EnvironmentState::InUse);
        }
    }

    /// Issue a self-signed certificate into this environment's TLS store
    ///
    /// Each hostname can be issued once per environment.
    pub fn issue_certificate(&self, hostname: &str) -> Result<CertificateRecord, GenerationError> {
        let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        let key = tls::file_stem(hostname);
        if let Some(existing) = issued.get(&key) {
            return Err(GenerationError::AlreadyIssued {
                hostname: hostname.to_string(),
                path: existing.cert_path.clone(),
            });
        }
        let record = tls::issue(&self.paths.tls, hostname)?;
        issued.insert(key, record.clone());
        Ok(record)
    }

    /// Hostnames certificates were issued for, sorted
    pub fn issued_hostnames(&self) -> Vec<String> {
        let issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = issued.values().map(|r| r.hostname.clone()).collect();
        names.sort();
        names
    }

    pub async fn start_backend(&self, spec: BackendSpec) -> Result<Backend, StartError> {
        backend::start(self, spec).await
    }

    /// Last `tail` lines of the proxy log
    pub async fn proxy_logs(&self, tail: Option<usize>) -> Result<String, RuntimeError> {
        self.runtime.logs(&self.proxy.id, tail).await
    }

    /// Sleep the configured convergence grace
    pub async fn await_convergence(&self) {
        sync::await_convergence(self.config.timeouts.convergence_grace()).await
    }

    /// Poll `check` under this environment's convergence policy
    pub async fn eventually<T, E, F, Fut>(
        &self,
        description: &str,
        check: F,
    ) -> Result<T, ReadinessError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        sync::eventually(&self.convergence_policy, description, check).await
    }

    /// Stop and remove the proxy, remove the network and delete the scratch tree
    ///
    /// Safe to call more than once; only the first call does anything.
    pub async fn release(&self) -> CleanupReport {
        if self.state() == EnvironmentState::Destroyed {
            return CleanupReport::default();
        }
        self.set_state(EnvironmentState::TearingDown);
        let report = self.cleanup.release().await;
        self.set_state(EnvironmentState::Destroyed);
        report
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let resources = self.cleanup.take();
        if resources.is_empty() {
            return;
        }
        warn!(
            environment = %self.id,
            pending = resources.len(),
            "environment dropped without release"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                info!(environment = %self.id, "scheduling release on the current runtime");
                handle.spawn(release_all(self.runtime.clone(), self.id.clone(), resources));
            }
            Err(_) => warn!(
                environment = %self.id,
                "no async runtime to release on; containers and network are left for sweep_orphans"
            ),
        }
    }
}
