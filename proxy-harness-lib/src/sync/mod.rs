//! Readiness and convergence waits
//!
//! All waits are bounded sleep-poll loops; suspension only happens at the
//! explicit sleeps and attempts below.

mod policy;

pub use policy::{Backoff, Deadline, Delays, RetryPolicy};

use std::fmt::Display;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use crate::error::{ReadinessError, RuntimeError};
use crate::runtime::ContainerRuntime;

/// Outcome of an exhausted poll loop
#[derive(Debug)]
pub(crate) struct Exhausted<E> {
    pub waited: Duration,
    pub attempts: u32,
    pub last: Option<E>,
}

/// Core loop: run `attempt` until it succeeds or the policy deadline passes
///
/// A `Break` result stops polling immediately (used for crash detection).
pub(crate) async fn poll_until<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut attempt: F,
) -> Result<T, PollFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
{
    let deadline = policy.start();
    let mut delays = policy.delays();
    let mut attempts = 0u32;
    let mut last;

    loop {
        attempts += 1;
        match attempt().await {
            Ok(value) => {
                if !policy.settle.is_zero() {
                    tokio::time::sleep(policy.settle).await;
                }
                return Ok(value);
            }
            Err(Attempt::Retry(e)) => last = Some(e),
            Err(Attempt::Break(e)) => return Err(PollFailure::Aborted(e)),
        }

        if deadline.expired() {
            return Err(PollFailure::Exhausted(Exhausted {
                waited: deadline.elapsed(),
                attempts,
                last,
            }));
        }

        let delay = delays.next().unwrap_or(policy.interval).min(deadline.remaining());
        trace!(attempt = attempts, delay_ms = delay.as_millis() as u64, "retrying");
        tokio::time::sleep(delay).await;
    }
}

/// Result of a single attempt inside `poll_until`
#[derive(Debug)]
pub(crate) enum Attempt<E> {
    Retry(E),
    Break(E),
}

#[derive(Debug)]
pub(crate) enum PollFailure<E> {
    Exhausted(Exhausted<E>),
    Aborted(E),
}

/// Wait until `address` accepts TCP connections
///
/// Each attempt is bounded by `policy.attempt_timeout`; on success the policy's
/// settle interval is slept before returning the time waited.
pub async fn await_reachable(
    address: SocketAddr,
    policy: &RetryPolicy,
) -> Result<Duration, ReadinessError> {
    let deadline = policy.start();
    let attempt_timeout = policy.attempt_timeout;

    let result = poll_until(policy, || async move {
        match tokio::time::timeout(attempt_timeout, TcpStream::connect(address)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(Attempt::Retry(e.to_string())),
            Err(_) => Err(Attempt::Retry(format!(
                "connect attempt timed out after {attempt_timeout:?}"
            ))),
        }
    })
    .await;

    match result {
        Ok(()) => {
            let waited = deadline.elapsed();
            debug!(%address, waited_ms = waited.as_millis() as u64, "address reachable");
            Ok(waited)
        }
        Err(PollFailure::Exhausted(ex)) => Err(ReadinessError::ReadinessTimeout {
            target: address.to_string(),
            waited: ex.waited,
            attempts: ex.attempts,
            last_error: ex.last.unwrap_or_default(),
        }),
        Err(PollFailure::Aborted(e)) => Err(ReadinessError::ReadinessTimeout {
            target: address.to_string(),
            waited: deadline.elapsed(),
            attempts: 0,
            last_error: e,
        }),
    }
}

/// Fixed-delay wait after a registration-affecting event
///
/// The proxy gives no signal when it has reconciled, so this only sleeps.
/// Probes shortly after may still observe the old state; prefer [`eventually`]
/// when the expected end state is known.
pub async fn await_convergence(grace: Duration) {
    info!(grace_ms = grace.as_millis() as u64, "waiting for proxy to converge");
    tokio::time::sleep(grace).await;
}

/// Poll `check` until it returns `Ok`, bounded by `policy`
///
/// The error of the last failed check is reported in `ConvergenceTimeout`, so
/// a flaky scenario shows what it actually observed.
pub async fn eventually<T, E, F, Fut>(
    policy: &RetryPolicy,
    description: &str,
    mut check: F,
) -> Result<T, ReadinessError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let result = poll_until(policy, || {
        let fut = check();
        async move { fut.await.map_err(|e| Attempt::Retry(e.to_string())) }
    })
    .await;

    match result {
        Ok(value) => {
            debug!(description, "converged");
            Ok(value)
        }
        Err(PollFailure::Exhausted(ex)) => Err(ReadinessError::ConvergenceTimeout {
            description: description.to_string(),
            waited: ex.waited,
            last_observation: ex.last.unwrap_or_else(|| "no attempt completed".to_string()),
        }),
        Err(PollFailure::Aborted(e)) => Err(ReadinessError::ConvergenceTimeout {
            description: description.to_string(),
            waited: Duration::ZERO,
            last_observation: e,
        }),
    }
}

/// Wait until the container log contains `needle`
///
/// Fails early with `ContainerExited` if the container stops running.
pub async fn await_log_line(
    runtime: &dyn ContainerRuntime,
    container: &str,
    needle: &str,
    policy: &RetryPolicy,
) -> Result<Duration, ReadinessError> {
    enum Stop {
        Pending,
        Exited(Option<i64>),
        Runtime(RuntimeError),
    }

    let deadline = policy.start();

    let result = poll_until(policy, || async move {
        let logs = runtime
            .logs(container, None)
            .await
            .map_err(|e| Attempt::Break(Stop::Runtime(e)))?;
        if logs.contains(needle) {
            return Ok(());
        }
        let state =
            runtime.inspect(container).await.map_err(|e| Attempt::Break(Stop::Runtime(e)))?;
        if !state.running {
            return Err(Attempt::Break(Stop::Exited(state.exit_code)));
        }
        Err(Attempt::Retry(Stop::Pending))
    })
    .await;

    match result {
        Ok(()) => {
            debug!(container, needle, "log line observed");
            Ok(deadline.elapsed())
        }
        Err(PollFailure::Exhausted(ex)) => Err(ReadinessError::LogLineTimeout {
            container: container.to_string(),
            needle: needle.to_string(),
            waited: ex.waited,
        }),
        Err(PollFailure::Aborted(Stop::Exited(exit_code))) => {
            Err(ReadinessError::ContainerExited { container: container.to_string(), exit_code })
        }
        Err(PollFailure::Aborted(Stop::Runtime(e))) => Err(ReadinessError::Runtime(e)),
        Err(PollFailure::Aborted(Stop::Pending)) => Err(ReadinessError::LogLineTimeout {
            container: container.to_string(),
            needle: needle.to_string(),
            waited: deadline.elapsed(),
        }),
    }
}
