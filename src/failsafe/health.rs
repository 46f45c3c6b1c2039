//! Tool health scoring
//!
//! Turns a tool's live sample window into a [`HealthSnapshot`]:
//! - success and error rates
//! - latency percentiles (p50, p95)
//! - SLA compliance (`min(1, sla / p95)`)
//! - recency of the last failure
//!
//! The weighted combination is mapped onto a status. An empty or too-short
//! window is always `UNAVAILABLE`: no data is never treated as health.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use toolguard_core::HealthStatus;

use super::window::WindowView;
use crate::clock::elapsed;
use crate::config::{HealthWeights, StatusThresholds, ToolSpec};

/// Floor for p95 so a zero-latency window cannot divide by zero
const LATENCY_EPSILON: Duration = Duration::from_millis(1);

/// Derived, ephemeral health view of one tool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    /// Tool id
    pub tool_id: String,
    /// Weighted score in `[0, 1]`
    pub score: f64,
    /// Status after dependency capping
    pub status: HealthStatus,
    /// 50th percentile latency (milliseconds)
    pub latency_p50_ms: Option<u64>,
    /// 95th percentile latency (milliseconds)
    pub latency_p95_ms: Option<u64>,
    /// Fraction of successful samples
    pub success_rate: f64,
    /// Fraction of failed or timed-out samples
    pub error_rate: f64,
    /// Live samples considered
    pub sample_count: usize,
    /// Failing dependencies that capped the status, if any
    pub capped_by: Vec<String>,
    /// When this snapshot was computed
    pub computed_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Snapshot for a tool with no usable data
    #[must_use]
    pub fn unavailable(tool_id: &str, sample_count: usize, now: DateTime<Utc>) -> Self {
        Self {
            tool_id: tool_id.to_string(),
            score: 0.0,
            status: HealthStatus::Unavailable,
            latency_p50_ms: None,
            latency_p95_ms: None,
            success_rate: 0.0,
            error_rate: 0.0,
            sample_count,
            capped_by: Vec::new(),
            computed_at: now,
        }
    }
}

/// The three normalised inputs to a score, each in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInputs {
    /// Fraction of successful samples
    pub success_rate: f64,
    /// `min(1, sla / p95)`
    pub sla_compliance: f64,
    /// 0 right after a failure, 1 once a full failure window has passed
    pub recency: f64,
}

impl ScoreInputs {
    /// Weighted mean, normalised by the weight sum and clamped to `[0, 1]`
    #[must_use]
    pub fn combine(&self, weights: &HealthWeights) -> f64 {
        let total = weights.success_rate + weights.sla_compliance + weights.recency;
        if total <= 0.0 {
            return 0.0;
        }
        let raw = weights.success_rate * self.success_rate
            + weights.sla_compliance * self.sla_compliance
            + weights.recency * self.recency;
        (raw / total).clamp(0.0, 1.0)
    }
}

/// Map a score onto a status
#[must_use]
pub fn classify(score: f64, thresholds: &StatusThresholds) -> HealthStatus {
    if score >= thresholds.healthy {
        HealthStatus::Healthy
    } else if score >= thresholds.degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Critical
    }
}

/// Stateless scorer; the sample window remains the source of truth
#[derive(Debug, Default, Clone, Copy)]
pub struct HealthScorer;

impl HealthScorer {
    /// Score `spec` from its live window.
    ///
    /// `dependencies` carries the already-computed status of each declared
    /// dependency. Never fails: missing data degrades to `UNAVAILABLE`.
    #[must_use]
    pub fn score(
        &self,
        spec: &ToolSpec,
        window: &WindowView,
        dependencies: &[(String, HealthStatus)],
        now: DateTime<Utc>,
    ) -> HealthSnapshot {
        let n = window.len();
        if n == 0 || n < spec.health.min_samples {
            return HealthSnapshot::unavailable(&spec.id, n, now);
        }

        let successes = window.iter().filter(|s| !s.outcome.is_error()).count();
        #[allow(clippy::cast_precision_loss)]
        let success_rate = successes as f64 / n as f64;
        let error_rate = 1.0 - success_rate;

        let mut latencies: Vec<Duration> = window.iter().map(|s| s.latency).collect();
        latencies.sort_unstable();
        let p50 = percentile(&latencies, 0.50);
        let p95 = percentile(&latencies, 0.95);

        let inputs = ScoreInputs {
            success_rate,
            sla_compliance: sla_compliance(spec.sla_latency, p95),
            recency: recency(window.last_error_at(), now, spec.breaker.failure_window),
        };
        let score = inputs.combine(&spec.health.weights);
        let own_status = classify(score, &spec.health.thresholds);

        let capped_by: Vec<String> = dependencies
            .iter()
            .filter(|(_, status)| status.is_failing())
            .map(|(id, _)| id.clone())
            .collect();
        let status = if capped_by.is_empty() || own_status != HealthStatus::Healthy {
            own_status
        } else {
            HealthStatus::Degraded
        };

        HealthSnapshot {
            tool_id: spec.id.clone(),
            score,
            status,
            latency_p50_ms: p50.map(as_millis),
            latency_p95_ms: p95.map(as_millis),
            success_rate,
            error_rate,
            sample_count: n,
            capped_by,
            computed_at: now,
        }
    }
}

/// `min(1, sla / max(p95, ε))`; 1 when no latency data exists
#[must_use]
pub fn sla_compliance(sla: Duration, p95: Option<Duration>) -> f64 {
    let Some(p95) = p95 else {
        return 1.0;
    };
    let p95 = p95.max(LATENCY_EPSILON);
    (sla.as_secs_f64() / p95.as_secs_f64()).min(1.0)
}

/// Linear ramp from 0 at the last failure to 1 after `horizon`
#[must_use]
pub fn recency(last_error: Option<DateTime<Utc>>, now: DateTime<Utc>, horizon: Duration) -> f64 {
    match last_error {
        None => 1.0,
        Some(at) if horizon.is_zero() => {
            if at < now { 1.0 } else { 0.0 }
        }
        Some(at) => (elapsed(at, now).as_secs_f64() / horizon.as_secs_f64()).min(1.0),
    }
}

/// Nearest-rank percentile over an ascending slice
fn percentile(sorted: &[Duration], p: f64) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let index = ((sorted.len() as f64) * p).floor() as usize;
    Some(sorted[index.min(sorted.len() - 1)])
}

#[allow(clippy::cast_possible_truncation)]
fn as_millis(d: Duration) -> u64 {
    d.as_millis() as u64
}
