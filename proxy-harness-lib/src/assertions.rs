//! Checks over probe results that report expected vs actual on failure

use http::StatusCode;
use std::fmt;

use crate::probe::ProbeResponse;

/// Longest body excerpt quoted in a failure message
const MAX_EXCERPT: usize = 512;

/// A failed check, carrying both sides of the comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionFailure {
    pub check: &'static str,
    pub expected: String,
    pub actual: String,
    pub context: Option<String>,
}

impl AssertionFailure {
    pub fn new(
        check: &'static str,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self { check, expected: expected.into(), actual: actual.into(), context: None }
    }

    /// Attach what was being probed, e.g. `GET example.com/api`
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl fmt::Display for AssertionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed", self.check)?;
        if let Some(context) = &self.context {
            write!(f, " ({context})")?;
        }
        write!(f, ": expected {}, actual {}", self.expected, self.actual)
    }
}

impl std::error::Error for AssertionFailure {}

fn excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.chars().count() <= MAX_EXCERPT {
        return format!("{text:?}");
    }
    let head: String = text.chars().take(MAX_EXCERPT).collect();
    format!("{head:?}... ({} bytes)", bytes.len())
}

/// `body` contains `needle` (bytes compared after lossy UTF-8 decoding)
pub fn contains(body: &[u8], needle: &str) -> Result<(), AssertionFailure> {
    if String::from_utf8_lossy(body).contains(needle) {
        return Ok(());
    }
    Err(AssertionFailure::new("contains", format!("body containing {needle:?}"), excerpt(body)))
}

/// `body` is exactly `expected`
pub fn equals(body: &[u8], expected: &[u8]) -> Result<(), AssertionFailure> {
    if body == expected {
        return Ok(());
    }
    Err(AssertionFailure::new("equals", excerpt(expected), excerpt(body)))
}

pub fn status_is(response: &ProbeResponse, expected: u16) -> Result<(), AssertionFailure> {
    if response.status.as_u16() == expected {
        return Ok(());
    }
    let expected = StatusCode::from_u16(expected)
        .map(|s| s.to_string())
        .unwrap_or_else(|_| expected.to_string());
    Err(AssertionFailure::new(
        "status_is",
        expected,
        format!("{} with body {}", response.status, excerpt(&response.body)),
    ))
}

/// Header `name` is present and one of its values contains `needle`
pub fn header_contains(
    response: &ProbeResponse,
    name: &str,
    needle: &str,
) -> Result<(), AssertionFailure> {
    let values: Vec<String> = response
        .headers
        .get_all(name)
        .iter()
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .collect();
    if values.iter().any(|v| v.contains(needle)) {
        return Ok(());
    }
    let actual = if values.is_empty() {
        format!("no {name} header")
    } else {
        format!("{name}: {values:?}")
    };
    Err(AssertionFailure::new("header_contains", format!("{name} containing {needle:?}"), actual))
}

/// Every failure collected by a [`SoftAssertions`] run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionReport {
    pub failures: Vec<AssertionFailure>,
}

impl fmt::Display for AssertionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} assertion(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  - {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AssertionReport {}

/// Collects failures so sibling checks still run after one fails
#[derive(Debug, Default)]
pub struct SoftAssertions {
    failures: Vec<AssertionFailure>,
}

impl SoftAssertions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one check; returns whether it passed
    pub fn check(&mut self, outcome: Result<(), AssertionFailure>) -> bool {
        match outcome {
            Ok(()) => true,
            Err(failure) => {
                tracing::debug!(%failure, "soft assertion failed");
                self.failures.push(failure);
                false
            }
        }
    }

    pub fn failures(&self) -> &[AssertionFailure] {
        &self.failures
    }

    pub fn finish(self) -> Result<(), AssertionReport> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(AssertionReport { failures: self.failures })
        }
    }
}
