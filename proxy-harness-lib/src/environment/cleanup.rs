//! Cleanup coordinator
//!
//! Resources are registered as they are created and released in reverse
//! order. Release is best-effort: every step is attempted, failures are logged
//! and reported but never returned as errors.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::runtime::{ContainerRuntime, LABEL_ENVIRONMENT};

const CLEANUP_STOP_GRACE: Duration = Duration::from_secs(2);

/// Something an environment created and must give back
#[derive(Debug)]
pub(crate) enum Resource {
    Container { id: String, name: String },
    Network(String),
    Directory(TempDir),
}

impl Resource {
    fn describe(&self) -> String {
        match self {
            Resource::Container { name, .. } => format!("container {name}"),
            Resource::Network(name) => format!("network {name}"),
            Resource::Directory(dir) => format!("directory {}", dir.path().display()),
        }
    }
}

/// Outcome of a release or sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub released: Vec<String>,
    pub failures: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn ok(&mut self, what: String) {
        debug!(resource = %what, "released");
        self.released.push(what);
    }

    fn failed(&mut self, what: String, error: impl std::fmt::Display) {
        warn!(resource = %what, error = %error, "cleanup step failed");
        self.failures.push(format!("{what}: {error}"));
    }

    fn merge(&mut self, other: CleanupReport) {
        self.released.extend(other.released);
        self.failures.extend(other.failures);
    }
}

/// Registry of one environment's resources
pub(crate) struct Cleanup {
    runtime: Arc<dyn ContainerRuntime>,
    environment: String,
    resources: Mutex<Vec<Resource>>,
}

impl Cleanup {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, environment: impl Into<String>) -> Self {
        Self { runtime, environment: environment.into(), resources: Mutex::new(Vec::new()) }
    }

    pub fn register(&self, resource: Resource) {
        debug!(environment = %self.environment, resource = %resource.describe(), "registered");
        self.lock().push(resource);
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Take everything still registered; later releases see nothing
    pub fn take(&self) -> Vec<Resource> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Resource>> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release everything registered so far; a second call does nothing
    pub async fn release(&self) -> CleanupReport {
        let resources = self.take();
        if resources.is_empty() {
            return CleanupReport::default();
        }
        release_all(self.runtime.clone(), self.environment.clone(), resources).await
    }
}

/// Release `resources` in reverse registration order
///
/// Containers labelled with the environment id but never registered (backends
/// the scenario did not remove) are removed before the network goes.
pub(crate) async fn release_all(
    runtime: Arc<dyn ContainerRuntime>,
    environment: String,
    resources: Vec<Resource>,
) -> CleanupReport {
    let mut report = CleanupReport::default();

    for resource in resources.into_iter().rev() {
        match resource {
            Resource::Container { id, name } => {
                remove_container(runtime.as_ref(), &id, &name, &mut report).await;
            }
            Resource::Network(name) => {
                let label = format!("{LABEL_ENVIRONMENT}={environment}");
                report.merge(remove_labelled_containers(runtime.as_ref(), &label).await);
                match runtime.remove_network(&name).await {
                    Ok(()) | Err(RuntimeError::NotFound(_)) => report.ok(format!("network {name}")),
                    Err(e) => report.failed(format!("network {name}"), e),
                }
            }
            Resource::Directory(dir) => {
                let what = format!("directory {}", dir.path().display());
                match dir.close() {
                    Ok(()) => report.ok(what),
                    Err(e) => report.failed(what, e),
                }
            }
        }
    }

    if report.is_clean() {
        info!(environment = %environment, released = report.released.len(), "environment released");
    } else {
        warn!(
            environment = %environment,
            failures = report.failures.len(),
            "environment released with failures"
        );
    }
    report
}

async fn remove_container(
    runtime: &dyn ContainerRuntime,
    id: &str,
    name: &str,
    report: &mut CleanupReport,
) {
    match runtime.stop_container(id, CLEANUP_STOP_GRACE).await {
        Ok(()) | Err(RuntimeError::NotFound(_)) => {}
        Err(e) => debug!(container = %name, error = %e, "stop failed, removing anyway"),
    }
    match runtime.remove_container(id).await {
        Ok(()) | Err(RuntimeError::NotFound(_)) => report.ok(format!("container {name}")),
        Err(e) => report.failed(format!("container {name}"), e),
    }
}

async fn remove_labelled_containers(runtime: &dyn ContainerRuntime, label: &str) -> CleanupReport {
    let mut report = CleanupReport::default();
    match runtime.list_containers(label).await {
        Ok(ids) => {
            for id in ids {
                remove_container(runtime, &id, &id, &mut report).await;
            }
        }
        Err(e) => report.failed(format!("containers labelled {label}"), e),
    }
    report
}

/// Remove containers and networks left behind by earlier runs
///
/// With `environment` set only that environment is swept; otherwise every
/// resource carrying the harness label is.
pub async fn sweep_orphans(
    runtime: &dyn ContainerRuntime,
    environment: Option<&str>,
) -> CleanupReport {
    let label = match environment {
        Some(id) => format!("{LABEL_ENVIRONMENT}={id}"),
        None => LABEL_ENVIRONMENT.to_string(),
    };

    let mut report = remove_labelled_containers(runtime, &label).await;
    match runtime.list_networks(&label).await {
        Ok(networks) => {
            for name in networks {
                match runtime.remove_network(&name).await {
                    Ok(()) | Err(RuntimeError::NotFound(_)) => report.ok(format!("network {name}")),
                    Err(e) => report.failed(format!("network {name}"), e),
                }
            }
        }
        Err(e) => report.failed(format!("networks labelled {label}"), e),
    }

    info!(
        label = %label,
        released = report.released.len(),
        failures = report.failures.len(),
        "orphan sweep finished"
    );
    report
}
