//! toolguard
//!
//! Health monitoring and failure containment for a fleet of analytic tools.
//!
//! # Features
//!
//! - **Sample Recorder**: bounded, age-limited per-tool windows of call outcomes
//! - **Health Scorer**: weighted success/SLA/recency score, capped by dependencies
//! - **Circuit Breaker**: CLOSED/OPEN/HALF_OPEN with a single half-open probe
//!   and exponential recovery backoff
//! - **Fallback Resolver**: retry, cached result, simplified result, skip or abort
//! - **Alert Router**: tier-aware severity, re-notification throttling,
//!   immediate delivery for urgent alerts and digests for the rest
//!
//! Callers embed a [`Monitor`] and drive it with [`Monitor::allow`] and
//! [`Monitor::record_and_score`], or hand it a [`ToolInvoker`] and use
//! [`Monitor::call`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod alerting;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod monitor;
pub mod persist;
pub mod scheduler;
pub mod server;

pub use error::{Error, Result, ToolError};
pub use monitor::{CallOutcome, Monitor, MonitorBuilder, ToolInvoker};
pub use toolguard_core::{BreakerPhase, FailureClass, HealthStatus, Outcome, Severity};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("tracing: {e}")))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Config(format!("tracing: {e}")))?,
    }

    Ok(())
}
