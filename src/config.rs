//! Configuration management
//!
//! The YAML/env layer (`Config`, `ToolConfig`) is loosely shaped so files stay
//! short; [`Config::tool_table`] turns it into validated [`ToolSpec`]s exactly
//! once at startup. Anything inconsistent is an [`Error::Config`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use toolguard_core::Severity;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dashboard server configuration
    pub server: ServerConfig,
    /// Periodic job configuration
    pub monitor: MonitorConfig,
    /// Fleet breaker defaults; a tool's `breaker` section overrides single fields
    pub breaker: CircuitBreakerConfig,
    /// Fleet scoring defaults; a tool's `health` section overrides single fields
    pub health: HealthConfig,
    /// Fleet retry defaults; a tool's `retry` section overrides single fields
    pub retry: RetryConfig,
    /// Alert routing
    pub alerting: AlertingConfig,
    /// Breaker state durability
    pub persistence: PersistenceConfig,
    /// Tool table
    pub tools: Vec<ToolConfig>,
}

impl Config {
    /// Load configuration from file and environment, then validate it
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, cannot be parsed, or describes
    /// an inconsistent tool table.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // TOOLGUARD_ALERTING__MIN_RENOTIFY_INTERVAL=10m etc.
        figment = figment.merge(Env::prefixed("TOOLGUARD_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string (no env layering)
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section for consistency
    pub fn validate(&self) -> Result<()> {
        self.breaker.validate("breaker")?;
        self.health.validate("health")?;
        self.retry.validate("retry")?;
        self.alerting.validate()?;
        self.monitor.validate()?;
        self.tool_table().map(|_| ())
    }

    /// Resolve per-tool overrides against the global defaults and validate
    /// the resulting table
    pub fn tool_table(&self) -> Result<ToolTable> {
        let specs = self
            .tools
            .iter()
            .map(|tool| tool.resolve(&self.breaker, &self.health, &self.retry))
            .collect::<Result<Vec<_>>>()?;
        ToolTable::new(specs)
    }
}

/// Dashboard server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Serve the dashboard at all
    pub enabled: bool,
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Expose `GET /metrics` (needs the `metrics` feature)
    pub metrics: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 39500,
            metrics: true,
        }
    }
}

/// Periodic job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// How often every tool is rescored
    #[serde(with = "humantime_serde")]
    pub health_poll_interval: Duration,
    /// How often overdue permits are expired
    #[serde(with = "humantime_serde")]
    pub watchdog_interval: Duration,
    /// Resolution of the scheduler driving both
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            health_poll_interval: Duration::from_secs(15),
            watchdog_interval: Duration::from_secs(1),
            tick_interval: Duration::from_millis(250),
        }
    }
}

impl MonitorConfig {
    fn validate(&self) -> Result<()> {
        non_zero("monitor.health_poll_interval", self.health_poll_interval)?;
        non_zero("monitor.watchdog_interval", self.watchdog_interval)?;
        non_zero("monitor.tick_interval", self.tick_interval)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Failures within `failure_window` before opening
    pub failure_threshold: u32,
    /// Window over which failures are counted while closed
    #[serde(with = "humantime_serde")]
    pub failure_window: Duration,
    /// Base time to wait before half-open; doubled per consecutive open
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
    /// Cap on the backed-off recovery timeout
    #[serde(with = "humantime_serde")]
    pub max_recovery_timeout: Duration,
    /// Concurrent probes permitted while half-open
    pub half_open_probe_budget: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            max_recovery_timeout: Duration::from_secs(600),
            half_open_probe_budget: 1,
        }
    }
}

impl CircuitBreakerConfig {
    fn validate(&self, at: &str) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::Config(format!("{at}.failure_threshold must be > 0")));
        }
        if self.half_open_probe_budget == 0 {
            return Err(Error::Config(format!(
                "{at}.half_open_probe_budget must be > 0"
            )));
        }
        non_zero(&format!("{at}.failure_window"), self.failure_window)?;
        non_zero(&format!("{at}.recovery_timeout"), self.recovery_timeout)?;
        if self.max_recovery_timeout < self.recovery_timeout {
            return Err(Error::Config(format!(
                "{at}.max_recovery_timeout ({:?}) is below recovery_timeout ({:?})",
                self.max_recovery_timeout, self.recovery_timeout
            )));
        }
        Ok(())
    }
}

/// Weights combining the three health inputs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthWeights {
    /// Weight of the success rate
    pub success_rate: f64,
    /// Weight of latency SLA compliance
    pub sla_compliance: f64,
    /// Weight of time since the last failure
    pub recency: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            success_rate: 0.5,
            sla_compliance: 0.3,
            recency: 0.2,
        }
    }
}

/// Score thresholds mapping a score to a status
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusThresholds {
    /// Minimum score for HEALTHY
    pub healthy: f64,
    /// Minimum score for DEGRADED; below is CRITICAL
    pub degraded: f64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            healthy: 0.85,
            degraded: 0.65,
        }
    }
}

/// Health scoring configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Input weights
    pub weights: HealthWeights,
    /// Status thresholds
    pub thresholds: StatusThresholds,
    /// Samples required before a score is computed at all
    pub min_samples: usize,
    /// Maximum samples kept per tool
    pub window_capacity: usize,
    /// Maximum sample age
    #[serde(with = "humantime_serde")]
    pub window_max_age: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            weights: HealthWeights::default(),
            thresholds: StatusThresholds::default(),
            min_samples: 1,
            window_capacity: 1000,
            window_max_age: Duration::from_secs(5 * 60),
        }
    }
}

impl HealthConfig {
    fn validate(&self, at: &str) -> Result<()> {
        let w = &self.weights;
        let all = [w.success_rate, w.sla_compliance, w.recency];
        if all.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(Error::Config(format!(
                "{at}.weights must be finite and non-negative"
            )));
        }
        if all.iter().sum::<f64>() <= 0.0 {
            return Err(Error::Config(format!("{at}.weights must not all be zero")));
        }
        let t = &self.thresholds;
        let in_range = |v: f64| v > 0.0 && v <= 1.0;
        if !in_range(t.healthy) || !in_range(t.degraded) || t.degraded >= t.healthy {
            return Err(Error::Config(format!(
                "{at}.thresholds must satisfy 0 < degraded < healthy <= 1 (got {} / {})",
                t.degraded, t.healthy
            )));
        }
        if self.min_samples == 0 {
            return Err(Error::Config(format!("{at}.min_samples must be > 0")));
        }
        if self.window_capacity < self.min_samples {
            return Err(Error::Config(format!(
                "{at}.window_capacity must be >= min_samples"
            )));
        }
        non_zero(&format!("{at}.window_max_age"), self.window_max_age)
    }
}

/// Retry configuration for transient failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum retry attempts (not counting the original call)
    pub max_attempts: u32,
    /// Initial backoff duration
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    fn validate(&self, at: &str) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::Config(format!("{at}.multiplier must be >= 1.0")));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(Error::Config(format!(
                "{at}.max_backoff is below initial_backoff"
            )));
        }
        Ok(())
    }
}

/// What the fallback resolver may do once nothing else applies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// A skipped or approximate answer is acceptable
    #[default]
    Degrade,
    /// No safe default exists; surface a typed error
    Abort,
}

/// A tool entry as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Tool id
    pub id: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Acceptable p95 latency
    #[serde(with = "humantime_serde", default = "default_sla_latency")]
    pub sla_latency: Duration,
    /// Hard timeout per call; the watchdog expires permits past it
    #[serde(with = "humantime_serde", default = "default_hard_timeout")]
    pub hard_timeout: Duration,
    /// Overall time budget for fallback resolution (defaults to `hard_timeout`)
    #[serde(with = "humantime_serde::option", default)]
    pub resolve_budget: Option<Duration>,
    /// Tools this one depends on
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Alerting tier, 1 (most critical) to 3
    #[serde(default = "default_tier")]
    pub tier: u8,
    /// Behaviour when every degradation strategy is exhausted
    #[serde(default)]
    pub criticality: Criticality,
    /// Transient failures may be retried
    #[serde(default = "default_true")]
    pub retry_eligible: bool,
    /// Oldest cached result still acceptable as a fallback; `None` disables caching
    #[serde(with = "humantime_serde::option", default)]
    pub max_staleness: Option<Duration>,
    /// Partial breaker settings laid over the fleet `breaker` section
    #[serde(default)]
    pub breaker: Option<YamlValue>,
    /// Partial scoring settings laid over the fleet `health` section
    #[serde(default)]
    pub health: Option<YamlValue>,
    /// Partial retry settings laid over the fleet `retry` section
    #[serde(default)]
    pub retry: Option<YamlValue>,
}

fn default_sla_latency() -> Duration {
    Duration::from_secs(2)
}

fn default_hard_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_tier() -> u8 {
    2
}

fn default_true() -> bool {
    true
}

impl ToolConfig {
    /// A tool entry with every setting at its default
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            sla_latency: default_sla_latency(),
            hard_timeout: default_hard_timeout(),
            resolve_budget: None,
            dependencies: Vec::new(),
            tier: default_tier(),
            criticality: Criticality::default(),
            retry_eligible: true,
            max_staleness: None,
            breaker: None,
            health: None,
            retry: None,
        }
    }

    fn resolve(
        &self,
        breaker: &CircuitBreakerConfig,
        health: &HealthConfig,
        retry: &RetryConfig,
    ) -> Result<ToolSpec> {
        let at = format!("tools[{}]", self.id);
        let spec = ToolSpec {
            id: self.id.clone(),
            description: self.description.clone(),
            sla_latency: self.sla_latency,
            hard_timeout: self.hard_timeout,
            resolve_budget: self.resolve_budget.unwrap_or(self.hard_timeout),
            dependencies: self.dependencies.clone(),
            tier: self.tier,
            criticality: self.criticality,
            retry_eligible: self.retry_eligible,
            max_staleness: self.max_staleness,
            breaker: overlay(breaker, self.breaker.as_ref(), &format!("{at}.breaker"))?,
            health: overlay(health, self.health.as_ref(), &format!("{at}.health"))?,
            retry: overlay(retry, self.retry.as_ref(), &format!("{at}.retry"))?,
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Lay a partial YAML section over `base`; keys the patch omits keep the
/// base value, nested sections merge key by key
fn overlay<T>(base: &T, patch: Option<&YamlValue>, at: &str) -> Result<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    let Some(patch) = patch.filter(|p| !p.is_null()) else {
        return Ok(base.clone());
    };
    if !patch.is_mapping() {
        return Err(Error::Config(format!("{at} must be a mapping")));
    }
    let mut merged = serde_yaml::to_value(base).map_err(|e| Error::Config(format!("{at}: {e}")))?;
    merge_yaml(&mut merged, patch);
    serde_yaml::from_value(merged).map_err(|e| Error::Config(format!("{at}: {e}")))
}

fn merge_yaml(base: &mut YamlValue, patch: &YamlValue) {
    match (base, patch) {
        (_, YamlValue::Null) => {}
        (YamlValue::Mapping(base), YamlValue::Mapping(patch)) => {
            for (key, value) in patch {
                match base.get_mut(key) {
                    Some(slot) => merge_yaml(slot, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

/// Validated, read-only description of a tool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    /// Tool id
    pub id: String,
    /// Human-readable description
    pub description: String,
    /// Acceptable p95 latency
    pub sla_latency: Duration,
    /// Hard timeout per call
    pub hard_timeout: Duration,
    /// Overall time budget for fallback resolution
    pub resolve_budget: Duration,
    /// Tools this one depends on
    pub dependencies: Vec<String>,
    /// Alerting tier, 1 (most critical) to 3
    pub tier: u8,
    /// Behaviour when every degradation strategy is exhausted
    pub criticality: Criticality,
    /// Transient failures may be retried
    pub retry_eligible: bool,
    /// Oldest cached result still acceptable as a fallback
    pub max_staleness: Option<Duration>,
    /// Effective breaker settings
    pub breaker: CircuitBreakerConfig,
    /// Effective scoring settings
    pub health: HealthConfig,
    /// Effective retry settings
    pub retry: RetryConfig,
}

impl ToolSpec {
    /// A spec with every setting at its default
    pub fn with_defaults(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            sla_latency: default_sla_latency(),
            hard_timeout: default_hard_timeout(),
            resolve_budget: default_hard_timeout(),
            dependencies: Vec::new(),
            tier: default_tier(),
            criticality: Criticality::default(),
            retry_eligible: true,
            max_staleness: None,
            breaker: CircuitBreakerConfig::default(),
            health: HealthConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Check this spec in isolation
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Config("tool id must not be empty".to_string()));
        }
        let at = format!("tools[{}]", self.id);
        non_zero(&format!("{at}.sla_latency"), self.sla_latency)?;
        non_zero(&format!("{at}.hard_timeout"), self.hard_timeout)?;
        non_zero(&format!("{at}.resolve_budget"), self.resolve_budget)?;
        if !(1..=3).contains(&self.tier) {
            return Err(Error::Config(format!(
                "{at}.tier must be 1, 2 or 3 (got {})",
                self.tier
            )));
        }
        if let Some(staleness) = self.max_staleness {
            non_zero(&format!("{at}.max_staleness"), staleness)?;
        }
        if self.dependencies.iter().any(|d| d == &self.id) {
            return Err(Error::Config(format!("{at} depends on itself")));
        }
        self.breaker.validate(&format!("{at}.breaker"))?;
        self.health.validate(&format!("{at}.health"))?;
        self.retry.validate(&format!("{at}.retry"))
    }
}

/// Validated tool table, keyed by id
#[derive(Debug, Clone, Default)]
pub struct ToolTable {
    specs: HashMap<String, Arc<ToolSpec>>,
}

impl ToolTable {
    /// Build a table, rejecting duplicates, dangling dependencies and cycles
    pub fn new(specs: Vec<ToolSpec>) -> Result<Self> {
        let mut map = HashMap::with_capacity(specs.len());
        for spec in specs {
            spec.validate()?;
            if map.contains_key(&spec.id) {
                return Err(Error::Config(format!("duplicate tool id: {}", spec.id)));
            }
            map.insert(spec.id.clone(), Arc::new(spec));
        }

        for spec in map.values() {
            for dep in &spec.dependencies {
                if !map.contains_key(dep) {
                    return Err(Error::Config(format!(
                        "tools[{}] depends on unknown tool '{dep}'",
                        spec.id
                    )));
                }
            }
        }

        let table = Self { specs: map };
        table.check_acyclic()?;
        Ok(table)
    }

    /// Look up a tool
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<ToolSpec>> {
        self.specs.get(id)
    }

    /// All tool ids, sorted
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.specs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Specs in id order
    pub fn specs(&self) -> impl Iterator<Item = &Arc<ToolSpec>> {
        let mut specs: Vec<&Arc<ToolSpec>> = self.specs.values().collect();
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        specs.into_iter()
    }

    /// Number of tools
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    fn check_acyclic(&self) -> Result<()> {
        // Iterative three-colour DFS over the dependency graph.
        let mut done: HashSet<&str> = HashSet::new();
        for root in self.specs.keys() {
            if done.contains(root.as_str()) {
                continue;
            }
            let mut on_path: Vec<&str> = Vec::new();
            let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
            while let Some((id, next)) = stack.pop() {
                if next == 0 {
                    on_path.push(id);
                }
                let deps = &self.specs[id].dependencies;
                if let Some(dep) = deps.get(next) {
                    stack.push((id, next + 1));
                    if on_path.contains(&dep.as_str()) {
                        return Err(Error::Config(format!(
                            "dependency cycle through '{dep}'"
                        )));
                    }
                    if !done.contains(dep.as_str()) {
                        stack.push((dep.as_str(), 0));
                    }
                } else {
                    on_path.pop();
                    done.insert(id);
                }
            }
        }
        Ok(())
    }
}

/// Where an alert goes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DestinationKind {
    /// Structured log line
    Log,
    /// JSON POST to a URL
    Webhook {
        /// Target URL
        url: String,
        /// Request timeout
        #[serde(with = "humantime_serde", default = "default_webhook_timeout")]
        timeout: Duration,
    },
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(10)
}

/// An alert destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Destination name (used in logs and metrics)
    pub name: String,
    /// Transport
    #[serde(flatten)]
    pub kind: DestinationKind,
    /// Severities routed here; empty means all
    #[serde(default)]
    pub severities: Vec<Severity>,
}

impl DestinationConfig {
    /// Whether alerts of `severity` are routed to this destination
    #[must_use]
    pub fn accepts(&self, severity: Severity) -> bool {
        self.severities.is_empty() || self.severities.contains(&severity)
    }
}

/// Alert routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Minimum interval between notifications for the same tool
    #[serde(with = "humantime_serde")]
    pub min_renotify_interval: Duration,
    /// How often batched (MEDIUM/LOW/INFO) alerts are flushed
    #[serde(with = "humantime_serde")]
    pub digest_interval: Duration,
    /// Number of alerts retained in the outbox
    pub outbox_capacity: usize,
    /// Delivery retry policy per destination
    pub delivery: RetryConfig,
    /// How long shutdown waits for queued notifications to be delivered
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Destinations
    pub destinations: Vec<DestinationConfig>,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            min_renotify_interval: Duration::from_secs(5 * 60),
            digest_interval: Duration::from_secs(15 * 60),
            outbox_capacity: 1000,
            delivery: RetryConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(500),
                max_backoff: Duration::from_secs(30),
                multiplier: 2.0,
            },
            shutdown_grace: Duration::from_secs(10),
            destinations: vec![DestinationConfig {
                name: "log".to_string(),
                kind: DestinationKind::Log,
                severities: Vec::new(),
            }],
        }
    }
}

impl AlertingConfig {
    fn validate(&self) -> Result<()> {
        non_zero("alerting.digest_interval", self.digest_interval)?;
        if self.outbox_capacity == 0 {
            return Err(Error::Config(
                "alerting.outbox_capacity must be > 0".to_string(),
            ));
        }
        self.delivery.validate("alerting.delivery")?;
        let mut names = HashSet::new();
        for dest in &self.destinations {
            if !names.insert(dest.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate alert destination: {}",
                    dest.name
                )));
            }
            if let DestinationKind::Webhook { url, .. } = &dest.kind {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(Error::Config(format!(
                        "alerting.destinations[{}].url must be http(s)",
                        dest.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Breaker state durability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Persist breaker rows across restarts
    pub enabled: bool,
    /// JSON file holding one row per tool
    pub path: PathBuf,
    /// How often rows are flushed
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("toolguard-breakers.json"),
            flush_interval: Duration::from_secs(30),
        }
    }
}

fn non_zero(what: &str, d: Duration) -> Result<()> {
    if d.is_zero() {
        Err(Error::Config(format!("{what} must be > 0")))
    } else {
        Ok(())
    }
}

/// Human-readable serde for `Duration` ("250ms", "30s", "5m", "2h")
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to the shortest exact unit
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(*duration))
    }

    /// Deserialize human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Format a duration with the largest unit that divides it exactly
    #[must_use]
    pub fn format(d: Duration) -> String {
        let ms = d.as_millis();
        if ms % 1000 != 0 {
            format!("{ms}ms")
        } else if d.as_secs() % 3600 == 0 && d.as_secs() > 0 {
            format!("{}h", d.as_secs() / 3600)
        } else if d.as_secs() % 60 == 0 && d.as_secs() > 0 {
            format!("{}m", d.as_secs() / 60)
        } else {
            format!("{}s", d.as_secs())
        }
    }

    /// Parse "250ms", "30s", "5m", "2h" or a bare number of seconds
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let number = |n: &str| {
            n.trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        };
        let scaled = |n: u64, unit: u64| {
            n.checked_mul(unit)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("duration '{s}' is out of range"))
        };
        if let Some(ms) = s.strip_suffix("ms") {
            number(ms).map(Duration::from_millis)
        } else if let Some(h) = s.strip_suffix('h') {
            scaled(number(h)?, 3600)
        } else if let Some(m) = s.strip_suffix('m') {
            scaled(number(m)?, 60)
        } else if let Some(secs) = s.strip_suffix('s') {
            number(secs).map(Duration::from_secs)
        } else {
            number(s).map(Duration::from_secs)
        }
    }

    /// Same, for `Option<Duration>`
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize `Some` as a duration string and `None` as null
        ///
        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(d) => serializer.serialize_some(&super::format(*d)),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional duration string
        ///
        /// # Errors
        ///
        /// Returns a deserialization error if the string cannot be parsed as a duration.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
