use std::time::Duration;

use tokio::time::Instant;

/// How the interval between attempts evolves
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Every attempt waits `interval`
    Fixed,
    /// Each wait is the previous one times `multiplier`, capped at `max_interval`
    Exponential { multiplier: f64, max_interval: Duration },
}

/// Bounded polling policy shared by readiness and convergence waits
///
/// Convergence waits built on this are time-based approximations: the proxy
/// reconciles asynchronously and exposes no completion event.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Overall deadline
    pub timeout: Duration,
    /// Wait before the second attempt
    pub interval: Duration,
    /// Upper bound of a single attempt (connect, request)
    pub attempt_timeout: Duration,
    /// Pause after success before returning
    pub settle: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            interval: Duration::from_millis(250),
            attempt_timeout: Duration::from_millis(500),
            settle: Duration::ZERO,
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval, ..Default::default() }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sequence of waits between attempts
    pub fn delays(&self) -> Delays {
        Delays { next: self.interval, backoff: self.backoff }
    }

    /// Start the clock for one wait governed by this policy
    pub fn start(&self) -> Deadline {
        Deadline { started: Instant::now(), timeout: self.timeout }
    }
}

/// Iterator over successive retry intervals
#[derive(Debug, Clone)]
pub struct Delays {
    next: Duration,
    backoff: Backoff,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        if let Backoff::Exponential { multiplier, max_interval } = self.backoff {
            let grown = current.as_secs_f64() * multiplier.max(1.0);
            self.next = Duration::from_secs_f64(grown.min(max_interval.as_secs_f64()));
        }
        Some(current)
    }
}

/// Running deadline for a single wait
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    timeout: Duration,
}

impl Deadline {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.started.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.timeout
    }
}
