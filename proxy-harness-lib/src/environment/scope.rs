use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::warn;

use super::Environment;
use crate::config::HarnessConfig;
use crate::error::ProvisioningError;
use crate::runtime::ContainerRuntime;

/// Provision an environment, run `scenario` against it, then release it
///
/// Release happens whatever the scenario does: return `Ok`, return an error,
/// or panic. A panic is resumed once the environment is gone.
pub async fn with_environment<T, E, F, Fut>(
    runtime: Arc<dyn ContainerRuntime>,
    config: &HarnessConfig,
    scenario: F,
) -> Result<T, E>
where
    F: FnOnce(Arc<Environment>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<ProvisioningError>,
{
    let environment = Arc::new(Environment::provision(runtime, config).await?);
    environment.mark_in_use();

    let outcome = AssertUnwindSafe(scenario(environment.clone())).catch_unwind().await;

    let report = environment.release().await;
    if !report.is_clean() {
        warn!(
            environment = %environment.id(),
            failures = ?report.failures,
            "environment released with failures"
        );
    }

    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
