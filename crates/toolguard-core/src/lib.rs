//! Shared vocabulary for the toolguard reliability core.
//!
//! These types cross the boundary between the monitor and its collaborators
//! (tool adapters, dashboards, notification consumers), so they carry nothing
//! but serde derives.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a single tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The tool produced a result
    Success,
    /// The tool returned an error
    Failure,
    /// The tool did not answer within its hard timeout
    Timeout,
}

impl Outcome {
    /// Whether this outcome counts against the tool
    #[must_use]
    pub fn is_error(self) -> bool {
        !matches!(self, Self::Success)
    }
}

/// Transient-vs-permanent classification supplied by the calling adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Timeouts, connection resets: worth retrying
    Transient,
    /// Malformed input, auth failure: never retried
    Permanent,
}

impl FailureClass {
    /// Lower-case label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

/// Health status derived from a tool's recent history.
///
/// Variants are ordered from best to worst, so `a < b` means `a` is healthier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Score at or above the healthy threshold
    Healthy,
    /// Score between the degraded and healthy thresholds
    Degraded,
    /// Score below the degraded threshold
    Critical,
    /// No usable data
    Unavailable,
}

impl HealthStatus {
    /// `CRITICAL` or `UNAVAILABLE`
    #[must_use]
    pub fn is_failing(self) -> bool {
        matches!(self, Self::Critical | Self::Unavailable)
    }

    /// Lower-case label used in logs and metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
            Self::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerPhase {
    /// Calls pass through
    Closed,
    /// Calls fail fast
    Open,
    /// A bounded number of probe calls test recovery
    HalfOpen,
}

impl BreakerPhase {
    /// Label used in logs and status messages
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for BreakerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity, ordered from most to least urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Page someone now
    Critical,
    /// Dispatched immediately
    High,
    /// Batched into digests
    Medium,
    /// Batched into digests
    Low,
    /// Recoveries and other de-escalations
    Info,
}

impl Severity {
    /// Whether this severity is delivered individually rather than batched
    #[must_use]
    pub fn is_immediate(self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
            Self::Info => "INFO",
        };
        f.write_str(s)
    }
}
