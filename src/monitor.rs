//! The reliability core as one explicitly constructed object
//!
//! A [`Monitor`] owns, per tool, a sample window and a circuit breaker, plus
//! the fallback resolver and alert router shared by all tools. Build it once
//! with [`MonitorBuilder`] and pass it around by `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::time::{Instant, timeout};
use toolguard_core::{BreakerPhase, HealthStatus, Outcome};
use tracing::{debug, info, warn};

use crate::alerting::{AlertEvent, AlertRouter, AlertSink, router_from_config};
use crate::clock::{Clock, SystemClock, elapsed};
use crate::config::{Config, DestinationConfig, ToolSpec, ToolTable};
use crate::error::ToolError;
use crate::failsafe::{
    Admission, AttemptError, BreakerSnapshot, CacheStore, CircuitBreaker, FallbackContext,
    FallbackOutcome, FallbackReason, FallbackResolver, HealthScorer, HealthSnapshot,
    MemoryCacheStore, Permit, Reattempt, SampleRecorder, Simplifier,
};
use crate::persist::{BreakerRecord, BreakerStore};
use crate::scheduler::Scheduler;
use crate::{Error, Result};

/// The opaque tool call, supplied by the embedding application
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invoke `tool_id` with `args`; the adapter classifies failures
    async fn invoke(&self, tool_id: &str, args: &Value) -> std::result::Result<Value, ToolError>;
}

/// Result of [`Monitor::call`]
#[derive(Debug)]
pub enum CallOutcome {
    /// The live call succeeded
    Live(Value),
    /// The call was denied or failed and a fallback applied
    Fallback(FallbackOutcome),
}

impl CallOutcome {
    /// Whether the result is non-authoritative
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        match self {
            Self::Live(_) => false,
            Self::Fallback(outcome) => outcome.is_degraded(),
        }
    }

    /// The usable result, if any
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        match self {
            Self::Live(value) => Some(value),
            Self::Fallback(outcome) => outcome.result(),
        }
    }
}

/// One dashboard row
#[derive(Debug, Clone, Serialize)]
pub struct ToolDashboard {
    /// Latest health status
    pub status: HealthStatus,
    /// Latest health score
    pub score: f64,
    /// Breaker phase
    pub breaker_phase: BreakerPhase,
    /// Most recent alert
    pub last_alert: Option<AlertEvent>,
    /// Breaker detail
    pub breaker: BreakerSnapshot,
    /// Breaker status line
    pub breaker_message: String,
    /// Latest health snapshot
    pub health: HealthSnapshot,
}

/// Builder for [`Monitor`]
pub struct MonitorBuilder {
    config: Config,
    clock: Arc<dyn Clock>,
    invoker: Option<Arc<dyn ToolInvoker>>,
    cache: Option<Arc<dyn CacheStore>>,
    sinks: Option<Vec<(DestinationConfig, Arc<dyn AlertSink>)>>,
}

impl MonitorBuilder {
    /// Start from a configuration
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            invoker: None,
            cache: None,
            sinks: None,
        }
    }

    /// Use a custom clock
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the tool invoker (required by `call` and the retry fallback)
    #[must_use]
    pub fn invoker(mut self, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Use a custom cache store (default: in-memory)
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use explicit alert sinks instead of the configured destinations
    #[must_use]
    pub fn alert_sinks(mut self, sinks: Vec<(DestinationConfig, Arc<dyn AlertSink>)>) -> Self {
        self.sinks = Some(sinks);
        self
    }

    /// Validate the configuration and build the monitor
    pub fn build(self) -> Result<Monitor> {
        self.config.validate()?;
        let tools = self.config.tool_table()?;
        let alerts = match self.sinks {
            Some(sinks) => AlertRouter::new(self.config.alerting.clone(), sinks),
            None => router_from_config(&self.config.alerting)?,
        };
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCacheStore::new()));

        info!(tools = tools.len(), "Monitor ready");
        Ok(Monitor {
            config: self.config,
            tools,
            breakers: DashMap::new(),
            recorder: SampleRecorder::new(),
            scorer: HealthScorer,
            snapshots: DashMap::new(),
            resolver: FallbackResolver::new(cache, Arc::clone(&self.clock)),
            alerts,
            invoker: self.invoker,
            clock: self.clock,
        })
    }
}

/// Per-tool health tracking, circuit breaking, fallback and alerting
pub struct Monitor {
    config: Config,
    tools: ToolTable,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    recorder: SampleRecorder,
    scorer: HealthScorer,
    snapshots: DashMap<String, HealthSnapshot>,
    resolver: FallbackResolver,
    alerts: AlertRouter,
    invoker: Option<Arc<dyn ToolInvoker>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("tools", &self.tools.len())
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// Configuration the monitor was built from
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The validated tool table
    #[must_use]
    pub fn tools(&self) -> &ToolTable {
        &self.tools
    }

    /// The alert router
    #[must_use]
    pub fn alerts(&self) -> &AlertRouter {
        &self.alerts
    }

    /// The fallback cache
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        self.resolver.cache()
    }

    /// Current time from the monitor's clock
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Ask the breaker whether a call to `tool_id` may proceed
    pub fn allow(&self, tool_id: &str) -> Result<Admission> {
        let spec = self.spec(tool_id)?;
        let admission = self.breaker(&spec).allow(self.clock.now());
        if let Admission::Denied(denial) = &admission {
            telemetry_metrics::counter!(
                "toolguard_denials_total",
                "tool" => tool_id.to_string(),
                "reason" => match denial.reason {
                    crate::failsafe::DenyReason::Open => "open",
                    crate::failsafe::DenyReason::ProbeInFlight => "probe_in_flight",
                }
            )
            .increment(1);
        }
        Ok(admission)
    }

    /// Report a granted call's outcome, record its sample and rescore.
    ///
    /// A late report for a permit the watchdog already expired is not
    /// recorded again: the watchdog wrote a timeout sample for it.
    pub fn record_and_score(
        &self,
        permit: Permit,
        outcome: Outcome,
        latency: Duration,
    ) -> Result<HealthSnapshot> {
        let spec = self.spec(permit.tool_id())?;
        Ok(self.report(&spec, permit, outcome, latency))
    }

    /// Score a tool from its current window, alerting on status change
    pub fn score(&self, tool_id: &str) -> Result<HealthSnapshot> {
        let spec = self.spec(tool_id)?;
        Ok(self.observe(&spec, self.clock.now()))
    }

    /// Rescore every tool; returns snapshots sorted by tool id
    pub fn poll_health(&self) -> Vec<HealthSnapshot> {
        let now = self.clock.now();
        let mut memo = HashMap::new();
        let snapshots: Vec<HealthSnapshot> = self
            .tools
            .ids()
            .into_iter()
            .filter_map(|id| self.tools.get(&id).cloned())
            .map(|spec| {
                let snapshot = self.compute(&spec, now, &mut memo);
                self.publish(&spec, snapshot.clone());
                snapshot
            })
            .collect();
        debug!(tools = snapshots.len(), "Health poll complete");
        snapshots
    }

    /// Choose a degradation strategy for a denied or failed call
    pub async fn resolve(
        &self,
        tool_id: &str,
        reason: FallbackReason,
        ctx: &FallbackContext,
    ) -> Result<FallbackOutcome> {
        let spec = self.spec(tool_id)?;
        let reattempt: Option<&dyn Reattempt> = self.invoker.as_ref().map(|_| self as &dyn Reattempt);
        Ok(self.resolver.resolve(&spec, reason, ctx, reattempt).await)
    }

    /// Guarded call: allow, invoke under the hard timeout, record, and fall
    /// back on denial or failure
    pub async fn call(&self, tool_id: &str, ctx: &FallbackContext) -> Result<CallOutcome> {
        let spec = self.spec(tool_id)?;
        if self.invoker.is_none() {
            return Err(Error::Internal("no tool invoker configured".to_string()));
        }

        let reason = match self.attempt(&spec, &ctx.args).await {
            Ok(value) => return Ok(CallOutcome::Live(value)),
            Err(e) => FallbackReason::from(e),
        };
        let reattempt: Option<&dyn Reattempt> = Some(self);
        Ok(CallOutcome::Fallback(
            self.resolver.resolve(&spec, reason, ctx, reattempt).await,
        ))
    }

    /// Watchdog pass: time out every permit past its hard timeout.
    ///
    /// Returns the number of permits expired.
    pub fn expire_overdue(&self) -> usize {
        let now = self.clock.now();
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|b| Arc::clone(b.value())).collect();

        let mut total = 0;
        for breaker in breakers {
            let expired = breaker.expire_overdue(now);
            if expired.is_empty() {
                continue;
            }
            let Some(spec) = self.tools.get(breaker.tool_id()).cloned() else {
                continue;
            };
            for permit in &expired {
                self.recorder
                    .record(&spec, now, elapsed(permit.issued_at, now), Outcome::Timeout);
            }
            total += expired.len();
            self.observe(&spec, now);
        }
        total
    }

    /// Operator reset: fresh breaker, empty history, no throttling
    pub fn reset_tool(&self, tool_id: &str) -> Result<()> {
        let spec = self.spec(tool_id)?;
        let now = self.clock.now();
        self.breaker(&spec).reset(now);
        self.recorder.reset(tool_id);
        self.snapshots.remove(tool_id);
        self.alerts.reset_tool(tool_id);
        info!(tool = %tool_id, "Tool state reset");
        Ok(())
    }

    /// Register the simplified computation used as a fallback for `tool_id`
    pub fn register_simplifier(&self, tool_id: &str, simplifier: Arc<dyn Simplifier>) -> Result<()> {
        self.spec(tool_id)?;
        self.resolver.register_simplifier(tool_id, simplifier);
        Ok(())
    }

    /// Rows for every breaker created so far, sorted by tool id
    #[must_use]
    pub fn breaker_records(&self) -> Vec<BreakerRecord> {
        let now = self.clock.now();
        let mut records: Vec<BreakerRecord> =
            self.breakers.iter().map(|b| b.value().record(now)).collect();
        records.sort_by(|a, b| a.tool_id.cmp(&b.tool_id));
        records
    }

    /// Restore breakers from persisted rows; rows for unknown tools are skipped
    pub fn restore_breakers(&self, records: &[BreakerRecord]) -> usize {
        let mut restored = 0;
        for record in records {
            match self.tools.get(&record.tool_id).cloned() {
                Some(spec) => {
                    self.breaker(&spec).restore(record);
                    restored += 1;
                }
                None => warn!(tool = %record.tool_id, "Ignoring breaker row for unknown tool"),
            }
        }
        restored
    }

    /// Status, score, breaker phase and last alert for every tool
    #[must_use]
    pub fn dashboard_snapshot(&self) -> BTreeMap<String, ToolDashboard> {
        let now = self.clock.now();
        self.tools
            .ids()
            .into_iter()
            .filter_map(|id| self.tools.get(&id).cloned())
            .map(|spec| {
                let health = self
                    .snapshots
                    .get(&spec.id)
                    .map(|s| s.value().clone())
                    .unwrap_or_else(|| HealthSnapshot::unavailable(&spec.id, 0, now));
                let breaker = self.breaker(&spec);
                let snapshot = breaker.snapshot(now);
                let row = ToolDashboard {
                    status: health.status,
                    score: health.score,
                    breaker_phase: snapshot.phase,
                    last_alert: self.alerts.last_alert(&spec.id),
                    breaker_message: breaker.status_message(now),
                    breaker: snapshot,
                    health,
                };
                (spec.id.clone(), row)
            })
            .collect()
    }

    /// Register the `health_poll`, `watchdog` and `alert_digest` jobs, plus
    /// `breaker_flush` when a store is given
    pub fn schedule(self: &Arc<Self>, scheduler: &Scheduler, store: Option<Arc<dyn BreakerStore>>) {
        let intervals = self.config.monitor.clone();

        let monitor = Arc::clone(self);
        scheduler.register(
            "health_poll",
            intervals.health_poll_interval,
            Arc::new(move |_| {
                let monitor = Arc::clone(&monitor);
                Box::pin(async move {
                    monitor.poll_health();
                })
            }),
        );

        let monitor = Arc::clone(self);
        scheduler.register(
            "watchdog",
            intervals.watchdog_interval,
            Arc::new(move |_| {
                let monitor = Arc::clone(&monitor);
                Box::pin(async move {
                    monitor.expire_overdue();
                })
            }),
        );

        let monitor = Arc::clone(self);
        scheduler.register(
            "alert_digest",
            self.config.alerting.digest_interval,
            Arc::new(move |now| {
                let monitor = Arc::clone(&monitor);
                Box::pin(async move {
                    monitor.alerts.flush_digest(now);
                })
            }),
        );

        if let Some(store) = store {
            let monitor = Arc::clone(self);
            scheduler.register(
                "breaker_flush",
                self.config.persistence.flush_interval,
                Arc::new(move |_| {
                    let monitor = Arc::clone(&monitor);
                    let store = Arc::clone(&store);
                    Box::pin(async move {
                        if let Err(e) = store.save(&monitor.breaker_records()).await {
                            warn!(error = %e, "Failed to persist breaker state");
                        }
                    })
                }),
            );
        }
    }

    fn spec(&self, tool_id: &str) -> Result<Arc<ToolSpec>> {
        self.tools
            .get(tool_id)
            .cloned()
            .ok_or_else(|| Error::UnknownTool(tool_id.to_string()))
    }

    fn breaker(&self, spec: &ToolSpec) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(spec.id.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(spec, self.clock.now())))
            .clone()
    }

    fn report(&self, spec: &ToolSpec, permit: Permit, outcome: Outcome, latency: Duration) -> HealthSnapshot {
        let now = self.clock.now();
        let effect = self.breaker(spec).report(permit, outcome, now);
        if effect.accounted {
            self.recorder.record(spec, now, latency, outcome);
        }
        self.observe(spec, now)
    }

    fn observe(&self, spec: &ToolSpec, now: DateTime<Utc>) -> HealthSnapshot {
        let snapshot = self.compute(spec, now, &mut HashMap::new());
        self.publish(spec, snapshot.clone());
        snapshot
    }

    // Dependencies are scored first, depth-first; the tool table is acyclic.
    fn compute(
        &self,
        spec: &ToolSpec,
        now: DateTime<Utc>,
        memo: &mut HashMap<String, HealthSnapshot>,
    ) -> HealthSnapshot {
        if let Some(done) = memo.get(&spec.id) {
            return done.clone();
        }
        let dependencies: Vec<(String, HealthStatus)> = spec
            .dependencies
            .iter()
            .filter_map(|id| self.tools.get(id).cloned())
            .map(|dep| {
                let status = self.compute(&dep, now, memo).status;
                (dep.id.clone(), status)
            })
            .collect();
        let window = self.recorder.window(&spec.id, now);
        let snapshot = self.scorer.score(spec, &window, &dependencies, now);
        memo.insert(spec.id.clone(), snapshot.clone());
        snapshot
    }

    fn publish(&self, spec: &ToolSpec, snapshot: HealthSnapshot) {
        telemetry_metrics::gauge!("toolguard_health_score", "tool" => spec.id.clone())
            .set(snapshot.score);

        let old_status = self
            .snapshots
            .insert(spec.id.clone(), snapshot.clone())
            .map_or(HealthStatus::Unavailable, |old| old.status);

        let rationale = rationale(&snapshot);
        if let Some(event) = AlertEvent::for_transition(
            &spec.id,
            spec.tier,
            old_status,
            snapshot.status,
            snapshot.computed_at,
            rationale,
        ) {
            info!(
                tool = %spec.id,
                from = %old_status,
                to = %snapshot.status,
                score = snapshot.score,
                "Health status changed"
            );
            self.alerts.notify(event);
        }
    }
}

#[async_trait]
impl Reattempt for Monitor {
    async fn attempt(&self, spec: &ToolSpec, args: &Value) -> std::result::Result<Value, AttemptError> {
        let Some(invoker) = self.invoker.as_ref() else {
            return Err(AttemptError::Tool(ToolError::permanent("no tool invoker configured")));
        };
        let permit = match self.allow(&spec.id) {
            Ok(Admission::Permit(permit)) => permit,
            Ok(Admission::Denied(denial)) => return Err(AttemptError::Denied(denial)),
            Err(e) => return Err(AttemptError::Tool(ToolError::permanent(e.to_string()))),
        };

        let started = Instant::now();
        let result = timeout(spec.hard_timeout, invoker.invoke(&spec.id, args)).await;
        let latency = started.elapsed();

        let (outcome, result) = match result {
            Ok(Ok(value)) => (Outcome::Success, Ok(value)),
            Ok(Err(e)) => (Outcome::Failure, Err(AttemptError::Tool(e))),
            Err(_) => (Outcome::Timeout, Err(AttemptError::TimedOut(spec.hard_timeout))),
        };
        self.report(spec, permit, outcome, latency);

        match result {
            Ok(value) => {
                self.resolver
                    .remember(spec, value.clone(), self.clock.now())
                    .await;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }
}

fn rationale(snapshot: &HealthSnapshot) -> String {
    let mut text = format!(
        "score {:.2}, success rate {:.0}% over {} samples",
        snapshot.score,
        snapshot.success_rate * 100.0,
        snapshot.sample_count
    );
    if let Some(p95) = snapshot.latency_p95_ms {
        text.push_str(&format!(", p95 {p95}ms"));
    }
    if !snapshot.capped_by.is_empty() {
        text.push_str(&format!(", capped by {}", snapshot.capped_by.join(", ")));
    }
    text
}
