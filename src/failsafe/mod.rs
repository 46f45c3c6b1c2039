//! Failsafe mechanisms: sample windows, health scoring, circuit breaking,
//! retry and fallback resolution

mod cache;
mod circuit_breaker;
mod fallback;
mod health;
mod retry;
mod window;

pub use cache::{CacheStats, CacheStatsSnapshot, CacheStore, CachedResult, MemoryCacheStore};
pub use circuit_breaker::{
    Admission, BreakerSnapshot, CircuitBreaker, Denial, DenyReason, ExpiredPermit, Permit,
    ReportEffect, Transition, backoff_timeout,
};
pub use fallback::{
    AttemptError, FallbackContext, FallbackOutcome, FallbackReason, FallbackReport,
    FallbackResolver, Reattempt, Simplifier,
};
pub use health::{HealthScorer, HealthSnapshot, ScoreInputs, classify, recency, sla_compliance};
pub use retry::{RetryFailure, RetryPolicy, StopReason, with_retry};
pub use window::{Sample, SampleRecorder, SampleWindow, WindowView};
