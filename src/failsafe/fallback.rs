//! Degradation strategies for denied or failed calls
//!
//! Strategies are tried in a fixed order until one applies:
//!
//! 1. retry with exponential backoff (transient failures of retry-eligible tools)
//! 2. the last cached success, if younger than the tool's `max_staleness`
//! 3. a registered simplified computation
//! 4. skip with a warning (optional calls to degrade-tier tools)
//! 5. abort with a typed error
//!
//! The whole resolution is bounded by the tool's `resolve_budget`. Every
//! outcome other than a successful retry is degraded and carries a reason.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use super::cache::CacheStore;
use super::circuit_breaker::{Denial, DenyReason};
use super::retry::{RetryPolicy, retry_after_failure};
use crate::clock::{Clock, elapsed};
use crate::config::{Criticality, ToolSpec, humantime_serde};
use crate::error::{Error, ToolError};

/// Why the caller is falling back
#[derive(Debug, Clone)]
pub enum FallbackReason {
    /// The breaker refused the call
    Denied(Denial),
    /// The call ran and failed
    Failed(ToolError),
    /// The call exceeded its hard timeout
    TimedOut(Duration),
}

impl FallbackReason {
    fn is_transient(&self) -> bool {
        match self {
            Self::Denied(_) => false,
            Self::Failed(e) => e.is_transient(),
            Self::TimedOut(_) => true,
        }
    }

    /// Lift into the crate-wide error taxonomy
    #[must_use]
    pub fn into_error(self, tool_id: &str) -> Error {
        match self {
            Self::Denied(denial) => denial.into_error(),
            Self::Failed(e) => e.into_error(tool_id),
            Self::TimedOut(after) => Error::TransientTool {
                tool: tool_id.to_string(),
                message: format!("timed out after {}", humantime_serde::format(after)),
            },
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied(denial) => match (denial.reason, denial.opened_at) {
                (DenyReason::Open, Some(at)) => {
                    write!(f, "breaker OPEN since {}", at.format("%H:%M:%S"))
                }
                (DenyReason::Open, None) => f.write_str("breaker OPEN"),
                (DenyReason::ProbeInFlight, _) => f.write_str("breaker HALF_OPEN, probe in flight"),
            },
            Self::Failed(e) => write!(f, "{} failure: {}", e.class.as_str(), e.message),
            Self::TimedOut(after) => {
                write!(f, "timed out after {}", humantime_serde::format(*after))
            }
        }
    }
}

/// Per-call context from the calling workflow
#[derive(Debug, Clone, Default)]
pub struct FallbackContext {
    /// Arguments of the original call, replayed on retry and simplification
    pub args: Value,
    /// The workflow can proceed without this tool's result
    pub optional: bool,
}

impl FallbackContext {
    /// Context for a required call
    #[must_use]
    pub fn required(args: Value) -> Self {
        Self {
            args,
            optional: false,
        }
    }

    /// Context for a call the workflow can skip
    #[must_use]
    pub fn optional(args: Value) -> Self {
        Self {
            args,
            optional: true,
        }
    }
}

/// What the caller gets instead of an unhandled error
#[derive(Debug)]
pub enum FallbackOutcome {
    /// A retry produced a live result
    Retried {
        /// Live result
        result: Value,
        /// Re-attempts made after the original failure
        attempts: u32,
    },
    /// A previously cached success
    Cached {
        /// Cached result
        result: Value,
        /// How old it is
        age: Duration,
        /// Audit reason
        reason: String,
    },
    /// An approximate answer from the tool's simplifier
    Simplified {
        /// Approximate result
        result: Value,
        /// Audit reason
        reason: String,
    },
    /// No result; the workflow proceeds without this tool
    Skipped {
        /// Audit warning
        warning: String,
    },
    /// No safe answer exists
    Aborted {
        /// Typed error
        error: Error,
    },
}

impl FallbackOutcome {
    /// Anything but a live retry is degraded
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !matches!(self, Self::Retried { .. })
    }

    /// Human-readable audit reason for degraded outcomes
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Retried { .. } => None,
            Self::Cached { reason, .. } | Self::Simplified { reason, .. } => Some(reason.clone()),
            Self::Skipped { warning } => Some(warning.clone()),
            Self::Aborted { error } => Some(error.to_string()),
        }
    }

    /// The usable result, if any
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        match self {
            Self::Retried { result, .. }
            | Self::Cached { result, .. }
            | Self::Simplified { result, .. } => Some(result),
            Self::Skipped { .. } | Self::Aborted { .. } => None,
        }
    }

    /// Strategy name, used as a metrics label
    #[must_use]
    pub fn strategy(&self) -> &'static str {
        match self {
            Self::Retried { .. } => "retried",
            Self::Cached { .. } => "cached",
            Self::Simplified { .. } => "simplified",
            Self::Skipped { .. } => "skipped",
            Self::Aborted { .. } => "aborted",
        }
    }

    /// Serializable view for API responses
    #[must_use]
    pub fn report(&self) -> FallbackReport {
        FallbackReport {
            strategy: self.strategy(),
            degraded: self.is_degraded(),
            reason: self.reason(),
            result: self.result().cloned(),
            age_ms: match self {
                Self::Cached { age, .. } => Some(u64::try_from(age.as_millis()).unwrap_or(u64::MAX)),
                _ => None,
            },
        }
    }
}

/// Flat, serializable form of a [`FallbackOutcome`]
#[derive(Debug, Clone, Serialize)]
pub struct FallbackReport {
    /// Strategy that applied
    pub strategy: &'static str,
    /// Whether the result is non-authoritative
    pub degraded: bool,
    /// Audit reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Result, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Age of a cached result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_ms: Option<u64>,
}

/// Approximate computation a tool declares for degraded operation
#[async_trait]
pub trait Simplifier: Send + Sync {
    /// Produce an approximate result for `args`
    async fn simplify(&self, args: &Value) -> std::result::Result<Value, ToolError>;
}

/// Why a single re-attempt failed
#[derive(Debug, Clone)]
pub enum AttemptError {
    /// The breaker refused the re-attempt
    Denied(Denial),
    /// The re-attempt ran and failed
    Tool(ToolError),
    /// The re-attempt exceeded the hard timeout
    TimedOut(Duration),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Denied(_) => false,
            Self::Tool(e) => e.is_transient(),
            Self::TimedOut(_) => true,
        }
    }
}

impl From<AttemptError> for FallbackReason {
    fn from(e: AttemptError) -> Self {
        match e {
            AttemptError::Denied(denial) => Self::Denied(denial),
            AttemptError::Tool(e) => Self::Failed(e),
            AttemptError::TimedOut(after) => Self::TimedOut(after),
        }
    }
}

impl From<&FallbackReason> for AttemptError {
    fn from(reason: &FallbackReason) -> Self {
        match reason {
            FallbackReason::Denied(denial) => Self::Denied(denial.clone()),
            FallbackReason::Failed(e) => Self::Tool(e.clone()),
            FallbackReason::TimedOut(after) => Self::TimedOut(*after),
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied(d) => write!(f, "{}", d.reason),
            Self::Tool(e) => write!(f, "{e}"),
            Self::TimedOut(after) => write!(f, "timed out after {}", humantime_serde::format(*after)),
        }
    }
}

/// Something that can re-issue a call through the breaker
#[async_trait]
pub trait Reattempt: Send + Sync {
    /// One guarded attempt of `spec` with `args`
    async fn attempt(&self, spec: &ToolSpec, args: &Value) -> std::result::Result<Value, AttemptError>;
}

/// Chooses a degradation strategy for a denied or failed call
pub struct FallbackResolver {
    cache: Arc<dyn CacheStore>,
    simplifiers: DashMap<String, Arc<dyn Simplifier>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for FallbackResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackResolver")
            .field("simplifiers", &self.simplifiers.len())
            .finish_non_exhaustive()
    }
}

impl FallbackResolver {
    /// Create a resolver over `cache`
    pub fn new(cache: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            simplifiers: DashMap::new(),
            clock,
        }
    }

    /// Register (or replace) the simplified computation for a tool
    pub fn register_simplifier(&self, tool_id: impl Into<String>, simplifier: Arc<dyn Simplifier>) {
        self.simplifiers.insert(tool_id.into(), simplifier);
    }

    /// The cache backing strategy 2
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// Store a fresh success for later cached fallback
    pub async fn remember(&self, spec: &ToolSpec, value: Value, at: DateTime<Utc>) {
        if spec.max_staleness.is_none() {
            return;
        }
        if let Err(e) = self.cache.set(&spec.id, value, at).await {
            warn!(tool = %spec.id, error = %e, "Failed to cache result");
        }
    }

    /// Resolve a denied or failed call into a [`FallbackOutcome`].
    ///
    /// `reattempt` is required for the retry strategy; without it retry is
    /// skipped.
    pub async fn resolve(
        &self,
        spec: &ToolSpec,
        reason: FallbackReason,
        ctx: &FallbackContext,
        reattempt: Option<&dyn Reattempt>,
    ) -> FallbackOutcome {
        let deadline = Instant::now() + spec.resolve_budget;
        let mut trail: Vec<String> = Vec::new();

        let outcome = 'resolved: {
            match self.try_retry(spec, &reason, ctx, reattempt, deadline).await {
                Ok(outcome) => break 'resolved outcome,
                Err(why) => trail.push(why),
            }
            match self.try_cache(spec, &reason, deadline).await {
                Ok(outcome) => break 'resolved outcome,
                Err(why) => trail.push(why),
            }
            match self.try_simplify(spec, &reason, ctx, deadline).await {
                Ok(outcome) => break 'resolved outcome,
                Err(why) => trail.push(why),
            }
            Self::skip_or_abort(spec, reason, ctx, &trail)
        };

        match &outcome {
            FallbackOutcome::Retried { attempts, .. } => {
                info!(tool = %spec.id, attempts, "Recovered by retry");
            }
            FallbackOutcome::Aborted { error } => {
                warn!(tool = %spec.id, kind = error.kind(), error = %error, "Fallback exhausted");
            }
            degraded => {
                info!(
                    tool = %spec.id,
                    strategy = degraded.strategy(),
                    reason = degraded.reason().as_deref().unwrap_or_default(),
                    "Returning degraded result"
                );
            }
        }
        telemetry_metrics::counter!(
            "toolguard_fallbacks_total",
            "tool" => spec.id.clone(),
            "strategy" => outcome.strategy()
        )
        .increment(1);

        outcome
    }

    async fn try_retry(
        &self,
        spec: &ToolSpec,
        reason: &FallbackReason,
        ctx: &FallbackContext,
        reattempt: Option<&dyn Reattempt>,
        deadline: Instant,
    ) -> std::result::Result<FallbackOutcome, String> {
        if !reason.is_transient() {
            return Err("retry: failure is not transient".to_string());
        }
        if !spec.retry_eligible {
            return Err("retry: tool is not retry-eligible".to_string());
        }
        let Some(reattempt) = reattempt else {
            return Err("retry: no invoker available".to_string());
        };

        let policy = RetryPolicy::new(&spec.retry);
        let budget = deadline.saturating_duration_since(Instant::now());
        let attempt = retry_after_failure(
            &policy,
            Some(budget),
            &spec.id,
            AttemptError::is_retryable,
            AttemptError::from(reason),
            || reattempt.attempt(spec, &ctx.args),
        );

        match timeout(budget, attempt).await {
            Ok(Ok((result, attempts))) => Ok(FallbackOutcome::Retried { result, attempts }),
            Ok(Err(failure)) => Err(format!(
                "retry: {} after {} attempt(s)",
                failure.error, failure.attempts
            )),
            Err(_) => Err(format!(
                "retry: budget of {} exhausted",
                humantime_serde::format(spec.resolve_budget)
            )),
        }
    }

    async fn try_cache(
        &self,
        spec: &ToolSpec,
        reason: &FallbackReason,
        deadline: Instant,
    ) -> std::result::Result<FallbackOutcome, String> {
        let Some(max_staleness) = spec.max_staleness else {
            return Err("cache: not enabled for this tool".to_string());
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        let cached = match timeout(remaining, self.cache.get(&spec.id)).await {
            Ok(Ok(Some(cached))) => cached,
            Ok(Ok(None)) => return Err("cache: no prior success".to_string()),
            Ok(Err(e)) => return Err(format!("cache: lookup failed: {e}")),
            Err(_) => return Err("cache: lookup timed out".to_string()),
        };

        let age = elapsed(cached.stored_at, self.clock.now());
        if age > max_staleness {
            return Err(format!(
                "cache: result is {} old, max staleness {}",
                humantime_serde::format(age),
                humantime_serde::format(max_staleness)
            ));
        }

        debug!(tool = %spec.id, age_ms = age.as_millis(), "Cache fallback hit");
        Ok(FallbackOutcome::Cached {
            result: cached.value,
            age,
            reason: format!(
                "using {}-old cached result: {reason}",
                humantime_serde::format(age)
            ),
        })
    }

    async fn try_simplify(
        &self,
        spec: &ToolSpec,
        reason: &FallbackReason,
        ctx: &FallbackContext,
        deadline: Instant,
    ) -> std::result::Result<FallbackOutcome, String> {
        let Some(simplifier) = self.simplifiers.get(&spec.id).map(|s| Arc::clone(s.value())) else {
            return Err("simplify: no simplified computation registered".to_string());
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, simplifier.simplify(&ctx.args)).await {
            Ok(Ok(result)) => Ok(FallbackOutcome::Simplified {
                result,
                reason: format!("using simplified computation: {reason}"),
            }),
            Ok(Err(e)) => Err(format!("simplify: {e}")),
            Err(_) => Err("simplify: timed out".to_string()),
        }
    }

    fn skip_or_abort(
        spec: &ToolSpec,
        reason: FallbackReason,
        ctx: &FallbackContext,
        trail: &[String],
    ) -> FallbackOutcome {
        if ctx.optional && spec.criticality == Criticality::Degrade {
            return FallbackOutcome::Skipped {
                warning: format!("skipped optional tool '{}': {reason}", spec.id),
            };
        }

        let error = match spec.criticality {
            Criticality::Abort => Error::FallbackExhausted {
                tool: spec.id.clone(),
                reason: format!("{reason}; {}", trail.join("; ")),
            },
            // Required degrade-tier call: surface the original failure so the
            // caller can decide whether to proceed.
            Criticality::Degrade => reason.into_error(&spec.id),
        };
        FallbackOutcome::Aborted { error }
    }
}
