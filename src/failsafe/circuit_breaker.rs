//! Circuit breaker implementation
//!
//! # State Transitions
//! ```text
//! CLOSED    -> OPEN:      failure_threshold failures within failure_window
//! OPEN      -> HALF_OPEN: recovery timeout (base * 2^consecutive_opens, capped) elapsed
//! HALF_OPEN -> CLOSED:    a probe succeeds; failure_count and consecutive_opens reset
//! HALF_OPEN -> OPEN:      a probe fails; consecutive_opens += 1
//! ```
//!
//! All of a tool's state sits behind one mutex and every decision is made
//! while holding it, so two racing callers can never both become the
//! half-open probe and no failure is lost to a race.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use toolguard_core::{BreakerPhase, Outcome};
use tracing::{debug, info, warn};

use crate::Error;
use crate::clock::{after, elapsed};
use crate::config::{CircuitBreakerConfig, ToolSpec};
use crate::persist::BreakerRecord;

/// Why a call was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The breaker is open and the recovery timeout has not elapsed
    Open,
    /// The breaker is half-open and its probe budget is spent
    ProbeInFlight,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("breaker open"),
            Self::ProbeInFlight => f.write_str("probe in flight"),
        }
    }
}

/// A refused call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Denial {
    /// Tool id
    pub tool_id: String,
    /// Why
    pub reason: DenyReason,
    /// When asking again could succeed
    pub retry_after: Duration,
    /// When the breaker last opened
    pub opened_at: Option<DateTime<Utc>>,
}

impl Denial {
    /// Lift into the crate-wide error taxonomy
    #[must_use]
    pub fn into_error(self) -> Error {
        Error::BreakerOpen {
            tool: self.tool_id,
            retry_after: self.retry_after,
        }
    }
}

/// Permission to make exactly one call.
///
/// Hand it back through `report` (or let the watchdog expire it); it cannot
/// be cloned, so it cannot be reported twice.
#[derive(Debug)]
#[must_use = "a permit must be reported exactly once"]
pub struct Permit {
    tool_id: String,
    id: u64,
    probe: bool,
    issued_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
}

impl Permit {
    /// Tool id
    #[must_use]
    pub fn tool_id(&self) -> &str {
        &self.tool_id
    }

    /// Unique id within the tool
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this is a half-open probe
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// When it was granted
    #[must_use]
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// When the watchdog will expire it
    #[must_use]
    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }
}

/// Result of `allow`
#[derive(Debug)]
#[must_use]
pub enum Admission {
    /// Go ahead
    Permit(Permit),
    /// Fail fast
    Denied(Denial),
}

impl Admission {
    /// Whether a permit was granted
    #[must_use]
    pub fn is_permitted(&self) -> bool {
        matches!(self, Self::Permit(_))
    }
}

/// A phase change caused by a report or an expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    /// Phase before
    pub from: BreakerPhase,
    /// Phase after
    pub to: BreakerPhase,
}

/// A permit the watchdog timed out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredPermit {
    /// Permit id
    pub id: u64,
    /// Whether it was a probe
    pub probe: bool,
    /// When it was granted
    pub issued_at: DateTime<Utc>,
    /// Transition caused by the synthesized timeout
    pub transition: Option<Transition>,
}

/// What applying a report did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportEffect {
    /// `false` when the permit had already been expired or reset away
    pub accounted: bool,
    /// Phase change, if any
    pub transition: Option<Transition>,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    probe: bool,
    issued_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
}

/// Mutable per-tool breaker state
#[derive(Debug)]
struct BreakerState {
    phase: BreakerPhase,
    /// Failure times inside the current window while closed
    failures: VecDeque<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    consecutive_opens: u32,
    in_flight: HashMap<u64, InFlight>,
    updated_at: DateTime<Utc>,
}

impl BreakerState {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            phase: BreakerPhase::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            consecutive_opens: 0,
            in_flight: HashMap::new(),
            updated_at: now,
        }
    }

    fn probes_in_flight(&self) -> usize {
        self.in_flight.values().filter(|f| f.probe).count()
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    /// Current phase
    pub phase: BreakerPhase,
    /// Failures counted in the current window
    pub failure_count: u32,
    /// Oldest failure in the current window
    pub window_start: Option<DateTime<Utc>>,
    /// When the breaker last opened
    pub opened_at: Option<DateTime<Utc>>,
    /// Opens since the last successful probe
    pub consecutive_opens: u32,
    /// Half-open probes currently outstanding
    pub probes_in_flight: usize,
    /// All outstanding permits
    pub permits_in_flight: usize,
    /// Recovery timeout that applies to the current (or next) open period
    #[serde(with = "crate::config::humantime_serde")]
    pub recovery_timeout: Duration,
}

/// Circuit breaker for one tool
pub struct CircuitBreaker {
    tool_id: String,
    config: CircuitBreakerConfig,
    hard_timeout: Duration,
    state: Mutex<BreakerState>,
    next_permit: AtomicU64,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("tool_id", &self.tool_id)
            .field("phase", &self.state.lock().phase)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker for `spec`
    #[must_use]
    pub fn new(spec: &ToolSpec, now: DateTime<Utc>) -> Self {
        Self {
            tool_id: spec.id.clone(),
            config: spec.breaker.clone(),
            hard_timeout: spec.hard_timeout,
            state: Mutex::new(BreakerState::fresh(now)),
            next_permit: AtomicU64::new(1),
        }
    }

    /// Tool id
    #[must_use]
    pub fn tool_id(&self) -> &str {
        &self.tool_id
    }

    /// Recovery timeout after `consecutive_opens` failed probes
    #[must_use]
    pub fn recovery_timeout_for(&self, consecutive_opens: u32) -> Duration {
        backoff_timeout(
            self.config.recovery_timeout,
            self.config.max_recovery_timeout,
            consecutive_opens,
        )
    }

    /// Decide whether a call may proceed
    #[tracing::instrument(level = "trace", skip(self), fields(tool = %self.tool_id))]
    pub fn allow(&self, now: DateTime<Utc>) -> Admission {
        let mut state = self.state.lock();

        if !self.config.enabled {
            return Admission::Permit(self.grant(&mut state, false, now));
        }

        if state.phase == BreakerPhase::Open {
            let opened_at = state.opened_at.unwrap_or(state.updated_at);
            let timeout = self.recovery_timeout_for(state.consecutive_opens);
            let waited = elapsed(opened_at, now);
            if waited < timeout {
                debug!(tool = %self.tool_id, retry_after_ms = (timeout - waited).as_millis(), "Circuit open, rejecting call");
                return Admission::Denied(Denial {
                    tool_id: self.tool_id.clone(),
                    reason: DenyReason::Open,
                    retry_after: timeout - waited,
                    opened_at: state.opened_at,
                });
            }
            self.transition(&mut state, BreakerPhase::HalfOpen, now);
        }

        if state.phase == BreakerPhase::Closed {
            return Admission::Permit(self.grant(&mut state, false, now));
        }

        let budget = usize::try_from(self.config.half_open_probe_budget).unwrap_or(usize::MAX);
        if state.probes_in_flight() < budget {
            debug!(tool = %self.tool_id, "Circuit half-open, granting probe");
            return Admission::Permit(self.grant(&mut state, true, now));
        }

        let retry_after = state
            .in_flight
            .values()
            .filter(|f| f.probe)
            .map(|f| elapsed(now, f.deadline))
            .min()
            .unwrap_or(Duration::ZERO);
        debug!(tool = %self.tool_id, "Probe in flight, rejecting call");
        Admission::Denied(Denial {
            tool_id: self.tool_id.clone(),
            reason: DenyReason::ProbeInFlight,
            retry_after,
            opened_at: state.opened_at,
        })
    }

    /// Apply the outcome of a granted call
    #[tracing::instrument(level = "trace", skip(self, permit), fields(tool = %self.tool_id, permit = permit.id))]
    pub fn report(&self, permit: Permit, outcome: Outcome, now: DateTime<Utc>) -> ReportEffect {
        let mut state = self.state.lock();
        let Some(flight) = state.in_flight.remove(&permit.id) else {
            debug!(tool = %self.tool_id, permit = permit.id, "Late report for expired permit ignored");
            return ReportEffect {
                accounted: false,
                transition: None,
            };
        };
        let transition = self.apply(&mut state, flight.probe, outcome, now);
        ReportEffect {
            accounted: true,
            transition,
        }
    }

    /// Time out every permit whose deadline has passed
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> Vec<ExpiredPermit> {
        let mut state = self.state.lock();
        let mut overdue: Vec<(u64, InFlight)> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, f)| (*id, *f))
            .collect();
        overdue.sort_by_key(|(id, _)| *id);

        let mut expired = Vec::with_capacity(overdue.len());
        for (id, flight) in overdue {
            state.in_flight.remove(&id);
            warn!(tool = %self.tool_id, permit = id, probe = flight.probe, "Permit exceeded hard timeout, synthesizing timeout");
            let transition = self.apply(&mut state, flight.probe, Outcome::Timeout, now);
            expired.push(ExpiredPermit {
                id,
                probe: flight.probe,
                issued_at: flight.issued_at,
                transition,
            });
        }
        expired
    }

    /// Current phase (as last stored; an expired OPEN turns HALF_OPEN on the next `allow`)
    #[must_use]
    pub fn phase(&self) -> BreakerPhase {
        self.state.lock().phase
    }

    /// Point-in-time view
    #[must_use]
    pub fn snapshot(&self, now: DateTime<Utc>) -> BreakerSnapshot {
        let mut state = self.state.lock();
        self.prune_failures(&mut state, now);
        BreakerSnapshot {
            phase: state.phase,
            failure_count: u32::try_from(state.failures.len()).unwrap_or(u32::MAX),
            window_start: state.failures.front().copied(),
            opened_at: state.opened_at,
            consecutive_opens: state.consecutive_opens,
            probes_in_flight: state.probes_in_flight(),
            permits_in_flight: state.in_flight.len(),
            recovery_timeout: self.recovery_timeout_for(state.consecutive_opens),
        }
    }

    /// Human-readable status line
    #[must_use]
    pub fn status_message(&self, now: DateTime<Utc>) -> String {
        let snap = self.snapshot(now);
        match snap.phase {
            BreakerPhase::Closed => format!(
                "Tool '{}' circuit breaker is closed ({} recent failures)",
                self.tool_id, snap.failure_count
            ),
            BreakerPhase::Open => {
                let waited = snap.opened_at.map_or(Duration::ZERO, |at| elapsed(at, now));
                let remaining = snap.recovery_timeout.saturating_sub(waited);
                format!(
                    "Tool '{}' circuit breaker is open (opened {} times in a row), retry in {} seconds",
                    self.tool_id,
                    snap.consecutive_opens + 1,
                    remaining.as_secs()
                )
            }
            BreakerPhase::HalfOpen => format!(
                "Tool '{}' circuit breaker is half-open, testing recovery ({} probe(s) in flight)",
                self.tool_id, snap.probes_in_flight
            ),
        }
    }

    /// Admin reset back to a fresh CLOSED breaker; outstanding permits are forgotten
    pub fn reset(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        let from = state.phase;
        *state = BreakerState::fresh(now);
        info!(tool = %self.tool_id, from = %from, "Circuit breaker reset by operator");
    }

    /// Persistable row
    #[must_use]
    pub fn record(&self, now: DateTime<Utc>) -> BreakerRecord {
        let mut state = self.state.lock();
        self.prune_failures(&mut state, now);
        BreakerRecord {
            tool_id: self.tool_id.clone(),
            phase: state.phase,
            failure_count: u32::try_from(state.failures.len()).unwrap_or(u32::MAX),
            opened_at: state.opened_at,
            consecutive_opens: state.consecutive_opens,
            updated_at: state.updated_at,
        }
    }

    /// Restore from a persisted row.
    ///
    /// A HALF_OPEN row comes back OPEN: its probe died with the old process.
    /// Restored failures are stamped at `updated_at`, so they age out normally.
    pub fn restore(&self, record: &BreakerRecord) {
        let mut state = self.state.lock();
        let phase = match record.phase {
            BreakerPhase::HalfOpen => BreakerPhase::Open,
            other => other,
        };
        state.phase = phase;
        state.failures = std::iter::repeat_n(record.updated_at, record.failure_count as usize)
            .take(self.config.failure_threshold as usize)
            .collect();
        state.opened_at = match phase {
            BreakerPhase::Open => Some(record.opened_at.unwrap_or(record.updated_at)),
            _ => record.opened_at,
        };
        state.consecutive_opens = record.consecutive_opens;
        state.in_flight.clear();
        state.updated_at = record.updated_at;
        info!(tool = %self.tool_id, phase = %phase, failures = record.failure_count, "Circuit breaker restored");
    }

    fn grant(&self, state: &mut BreakerState, probe: bool, now: DateTime<Utc>) -> Permit {
        let id = self.next_permit.fetch_add(1, Ordering::Relaxed);
        let deadline = after(now, self.hard_timeout);
        state.in_flight.insert(
            id,
            InFlight {
                probe,
                issued_at: now,
                deadline,
            },
        );
        Permit {
            tool_id: self.tool_id.clone(),
            id,
            probe,
            issued_at: now,
            deadline,
        }
    }

    fn apply(
        &self,
        state: &mut BreakerState,
        probe: bool,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        if !self.config.enabled {
            return None;
        }

        match (state.phase, probe) {
            (BreakerPhase::Closed, _) => {
                if !outcome.is_error() {
                    tracing::trace!("Success in closed state");
                    return None;
                }
                self.prune_failures(state, now);
                state.failures.push_back(now);
                state.updated_at = now;
                let failures = u32::try_from(state.failures.len()).unwrap_or(u32::MAX);
                warn!(
                    tool = %self.tool_id,
                    failures,
                    threshold = self.config.failure_threshold,
                    ?outcome,
                    "Failure in closed state"
                );
                if failures >= self.config.failure_threshold {
                    return Some(self.transition(state, BreakerPhase::Open, now));
                }
                None
            }
            (BreakerPhase::HalfOpen, true) => {
                if outcome.is_error() {
                    warn!(tool = %self.tool_id, ?outcome, "Probe failed, reopening circuit");
                    state.consecutive_opens = state.consecutive_opens.saturating_add(1);
                    Some(self.transition(state, BreakerPhase::Open, now))
                } else {
                    Some(self.transition(state, BreakerPhase::Closed, now))
                }
            }
            (BreakerPhase::HalfOpen, false) | (BreakerPhase::Open, _) => {
                tracing::trace!(phase = %state.phase, "Outcome of pre-open call ignored");
                None
            }
        }
    }

    fn transition(&self, state: &mut BreakerState, to: BreakerPhase, now: DateTime<Utc>) -> Transition {
        let from = state.phase;
        state.phase = to;
        state.updated_at = now;

        match to {
            BreakerPhase::Closed => {
                state.failures.clear();
                state.consecutive_opens = 0;
                state.opened_at = None;
                info!(tool = %self.tool_id, "Circuit breaker closed");
            }
            BreakerPhase::Open => {
                state.opened_at = Some(now);
                let failures = state.failures.len();
                state.failures.clear();
                warn!(
                    tool = %self.tool_id,
                    failures,
                    consecutive_opens = state.consecutive_opens,
                    recovery_timeout_ms = self.recovery_timeout_for(state.consecutive_opens).as_millis(),
                    "Circuit breaker opened"
                );
            }
            BreakerPhase::HalfOpen => {
                debug!(tool = %self.tool_id, "Circuit breaker half-open");
            }
        }

        telemetry_metrics::counter!(
            "toolguard_breaker_transitions_total",
            "tool" => self.tool_id.clone(),
            "to" => to.as_str()
        )
        .increment(1);

        Transition { from, to }
    }

    fn prune_failures(&self, state: &mut BreakerState, now: DateTime<Utc>) {
        while let Some(front) = state.failures.front() {
            if elapsed(*front, now) > self.config.failure_window {
                state.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// `base * 2^n`, capped at `cap`
#[must_use]
pub fn backoff_timeout(base: Duration, cap: Duration, n: u32) -> Duration {
    2u32.checked_pow(n)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(cap, |d| d.min(cap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn spec(threshold: u32) -> ToolSpec {
        let mut spec = ToolSpec::with_defaults("contingency_sim");
        spec.breaker.failure_threshold = threshold;
        spec
    }

    fn permit(admission: Admission) -> Permit {
        match admission {
            Admission::Permit(p) => p,
            Admission::Denied(d) => panic!("expected permit, got {d:?}"),
        }
    }

    fn denial(admission: Admission) -> Denial {
        match admission {
            Admission::Denied(d) => d,
            Admission::Permit(p) => panic!("expected denial, got {p:?}"),
        }
    }

    fn fail_n(cb: &CircuitBreaker, n: u32, at: DateTime<Utc>) {
        for _ in 0..n {
            let p = permit(cb.allow(at));
            cb.report(p, Outcome::Failure, at);
        }
    }

    #[test]
    fn opens_exactly_at_threshold() {
        let cb = CircuitBreaker::new(&spec(3), t0());

        fail_n(&cb, 2, t0());
        assert_eq!(cb.phase(), BreakerPhase::Closed);

        // Two failures leave the next call permitted; the third trips it.
        let p = permit(cb.allow(t0()));
        let effect = cb.report(p, Outcome::Failure, t0());
        assert_eq!(
            effect.transition,
            Some(Transition {
                from: BreakerPhase::Closed,
                to: BreakerPhase::Open
            })
        );
        let d = denial(cb.allow(t0()));
        assert_eq!(d.reason, DenyReason::Open);
        assert_eq!(d.retry_after, Duration::from_secs(30));
    }

    #[test]
    fn huge_hard_timeout_saturates_deadline() {
        let mut spec = spec(3);
        spec.hard_timeout = Duration::MAX;
        let cb = CircuitBreaker::new(&spec, t0());
        let p = permit(cb.allow(t0()));
        assert_eq!(p.deadline(), DateTime::<Utc>::MAX_UTC);
        assert!(cb.expire_overdue(t0() + secs(86_400)).is_empty());
    }

    #[test]
    fn failures_outside_window_do_not_accumulate() {
        let cb = CircuitBreaker::new(&spec(3), t0());
        fail_n(&cb, 2, t0());
        // 61s later the first two have aged out of the 60s window.
        fail_n(&cb, 2, t0() + secs(61));
        assert_eq!(cb.phase(), BreakerPhase::Closed);
        assert_eq!(cb.snapshot(t0() + secs(61)).failure_count, 2);
    }

    #[test]
    fn successes_do_not_hide_windowed_failures() {
        let cb = CircuitBreaker::new(&spec(3), t0());
        fail_n(&cb, 2, t0());
        let p = permit(cb.allow(t0()));
        cb.report(p, Outcome::Success, t0());
        fail_n(&cb, 1, t0() + secs(1));
        assert_eq!(cb.phase(), BreakerPhase::Open);
    }

    #[test]
    fn timeouts_count_as_failures() {
        let cb = CircuitBreaker::new(&spec(2), t0());
        for _ in 0..2 {
            let p = permit(cb.allow(t0()));
            cb.report(p, Outcome::Timeout, t0());
        }
        assert_eq!(cb.phase(), BreakerPhase::Open);
    }

    #[test]
    fn half_open_never_before_recovery_timeout() {
        let cb = CircuitBreaker::new(&spec(1), t0());
        fail_n(&cb, 1, t0());

        let d = denial(cb.allow(t0() + secs(29)));
        assert_eq!(d.retry_after, Duration::from_secs(1));
        assert_eq!(cb.phase(), BreakerPhase::Open);

        let p = permit(cb.allow(t0() + secs(30)));
        assert!(p.is_probe());
        assert_eq!(cb.phase(), BreakerPhase::HalfOpen);
    }

    #[test]
    fn single_probe_in_half_open() {
        let cb = CircuitBreaker::new(&spec(1), t0());
        fail_n(&cb, 1, t0());
        let at = t0() + secs(30);
        let probe = permit(cb.allow(at));
        let d = denial(cb.allow(at));
        assert_eq!(d.reason, DenyReason::ProbeInFlight);
        // Remaining time until the probe's hard timeout.
        assert_eq!(d.retry_after, Duration::from_secs(30));
        cb.report(probe, Outcome::Success, at);
        assert!(cb.allow(at).is_permitted());
    }

    #[test]
    fn probe_budget_above_one() {
        let mut s = spec(1);
        s.breaker.half_open_probe_budget = 2;
        let cb = CircuitBreaker::new(&s, t0());
        fail_n(&cb, 1, t0());
        let at = t0() + secs(30);
        let _a = permit(cb.allow(at));
        let _b = permit(cb.allow(at));
        assert_eq!(denial(cb.allow(at)).reason, DenyReason::ProbeInFlight);
    }

    #[test]
    fn probe_success_resets_counters() {
        let cb = CircuitBreaker::new(&spec(1), t0());
        fail_n(&cb, 1, t0());
        // Fail one probe to bump consecutive_opens.
        let p = permit(cb.allow(t0() + secs(30)));
        cb.report(p, Outcome::Failure, t0() + secs(30));
        assert_eq!(cb.snapshot(t0() + secs(30)).consecutive_opens, 1);

        let at = t0() + secs(90);
        let p = permit(cb.allow(at));
        let effect = cb.report(p, Outcome::Success, at);
        assert_eq!(effect.transition.map(|t| t.to), Some(BreakerPhase::Closed));
        let snap = cb.snapshot(at);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.consecutive_opens, 0);
        assert_eq!(snap.opened_at, None);
    }

    #[test]
    fn probe_failure_reopens_with_backoff() {
        let cb = CircuitBreaker::new(&spec(1), t0());
        fail_n(&cb, 1, t0());

        let at = t0() + secs(30);
        let p = permit(cb.allow(at));
        cb.report(p, Outcome::Failure, at);
        assert_eq!(cb.phase(), BreakerPhase::Open);

        // Second open period lasts 60s.
        let d = denial(cb.allow(at + secs(59)));
        assert_eq!(d.retry_after, Duration::from_secs(1));
        assert!(cb.allow(at + secs(60)).is_permitted());
    }

    #[test]
    fn recovery_timeout_monotonic_until_cap() {
        let cb = CircuitBreaker::new(&spec(1), t0());
        let mut previous = Duration::ZERO;
        for n in 0..5 {
            let timeout = cb.recovery_timeout_for(n);
            assert!(timeout > previous, "not strictly increasing at n={n}");
            previous = timeout;
        }
        assert_eq!(cb.recovery_timeout_for(5), Duration::from_secs(600));
        assert_eq!(cb.recovery_timeout_for(64), Duration::from_secs(600));
    }

    #[test]
    fn backoff_timeout_saturates() {
        let base = Duration::from_secs(30);
        let cap = Duration::from_secs(600);
        assert_eq!(backoff_timeout(base, cap, 0), base);
        assert_eq!(backoff_timeout(base, cap, 1), Duration::from_secs(60));
        assert_eq!(backoff_timeout(base, cap, 40), cap);
    }

    #[test]
    fn late_report_after_expiry_is_ignored() {
        let cb = CircuitBreaker::new(&spec(5), t0());
        let p = permit(cb.allow(t0()));
        let expired = cb.expire_overdue(t0() + secs(31));
        assert_eq!(expired.len(), 1);
        assert_eq!(cb.snapshot(t0() + secs(31)).failure_count, 1);

        let effect = cb.report(p, Outcome::Failure, t0() + secs(40));
        assert!(!effect.accounted);
        assert_eq!(cb.snapshot(t0() + secs(40)).failure_count, 1);
    }

    #[test]
    fn watchdog_leaves_fresh_permits_alone() {
        let cb = CircuitBreaker::new(&spec(5), t0());
        let p = permit(cb.allow(t0()));
        assert!(cb.expire_overdue(t0() + secs(29)).is_empty());
        assert!(cb.report(p, Outcome::Success, t0() + secs(29)).accounted);
    }

    #[test]
    fn expired_probe_reopens() {
        let cb = CircuitBreaker::new(&spec(1), t0());
        fail_n(&cb, 1, t0());
        let _probe = permit(cb.allow(t0() + secs(30)));
        let expired = cb.expire_overdue(t0() + secs(60));
        assert_eq!(expired.len(), 1);
        assert!(expired[0].probe);
        assert_eq!(cb.phase(), BreakerPhase::Open);
        assert_eq!(cb.snapshot(t0() + secs(60)).consecutive_opens, 1);
    }

    #[test]
    fn stale_closed_permit_does_not_reopen_half_open() {
        let cb = CircuitBreaker::new(&spec(1), t0());
        let slow = permit(cb.allow(t0()));
        fail_n(&cb, 1, t0());
        let probe = permit(cb.allow(t0() + secs(30)));
        // A call granted while closed finishes during the half-open probe.
        let effect = cb.report(slow, Outcome::Failure, t0() + secs(30));
        assert!(effect.transition.is_none());
        assert_eq!(cb.phase(), BreakerPhase::HalfOpen);
        cb.report(probe, Outcome::Success, t0() + secs(31));
        assert_eq!(cb.phase(), BreakerPhase::Closed);
    }

    #[test]
    fn disabled_breaker_never_opens() {
        let mut s = spec(1);
        s.breaker.enabled = false;
        let cb = CircuitBreaker::new(&s, t0());
        fail_n(&cb, 100, t0());
        assert!(cb.allow(t0()).is_permitted());
        assert!(cb.status_message(t0()).contains("closed"));
    }

    #[test]
    fn status_messages() {
        let cb = CircuitBreaker::new(&spec(2), t0());
        assert!(cb.status_message(t0()).contains("closed"));
        fail_n(&cb, 2, t0());
        let message = cb.status_message(t0() + secs(10));
        assert!(message.contains("Tool 'contingency_sim'"));
        assert!(message.contains("is open"));
        assert!(message.contains("retry in 20 seconds"));
        let _probe = permit(cb.allow(t0() + secs(30)));
        assert!(cb.status_message(t0() + secs(30)).contains("testing recovery"));
    }

    #[test]
    fn record_and_restore_round_trip() {
        let cb = CircuitBreaker::new(&spec(1), t0());
        fail_n(&cb, 1, t0());
        let record = cb.record(t0() + secs(5));
        assert_eq!(record.phase, BreakerPhase::Open);
        assert_eq!(record.opened_at, Some(t0()));

        let restored = CircuitBreaker::new(&spec(1), t0() + secs(5));
        restored.restore(&record);
        assert_eq!(restored.phase(), BreakerPhase::Open);
        assert_eq!(denial(restored.allow(t0() + secs(10))).retry_after, Duration::from_secs(20));
    }

    #[test]
    fn restored_half_open_comes_back_open() {
        let record = BreakerRecord {
            tool_id: "contingency_sim".to_string(),
            phase: BreakerPhase::HalfOpen,
            failure_count: 0,
            opened_at: Some(t0()),
            consecutive_opens: 2,
            updated_at: t0() + secs(120),
        };
        let cb = CircuitBreaker::new(&spec(1), t0());
        cb.restore(&record);
        assert_eq!(cb.phase(), BreakerPhase::Open);
        // 30s * 2^2 = 120s since t0 has elapsed, so the next call probes.
        assert!(permit(cb.allow(t0() + secs(120))).is_probe());
    }

    #[test]
    fn reset_returns_to_closed() {
        let cb = CircuitBreaker::new(&spec(1), t0());
        fail_n(&cb, 1, t0());
        cb.reset(t0() + secs(1));
        assert_eq!(cb.phase(), BreakerPhase::Closed);
        assert!(cb.allow(t0() + secs(1)).is_permitted());
    }

    #[test]
    fn concurrent_allow_grants_one_probe() {
        for _ in 0..20 {
            let cb = Arc::new(CircuitBreaker::new(&spec(1), t0()));
            fail_n(&cb, 1, t0());
            let at = t0() + secs(30);

            let callers = 8;
            let barrier = Arc::new(Barrier::new(callers));
            let handles: Vec<_> = (0..callers)
                .map(|_| {
                    let cb = Arc::clone(&cb);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        cb.allow(at)
                    })
                })
                .collect();

            let admissions: Vec<Admission> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            let granted = admissions.iter().filter(|a| a.is_permitted()).count();
            assert_eq!(granted, 1, "exactly one racing caller may probe");
            assert_eq!(cb.snapshot(at).probes_in_flight, 1);
            for admission in admissions {
                if let Admission::Permit(p) = admission {
                    cb.report(p, Outcome::Success, at);
                }
            }
        }
    }

    #[test]
    fn concurrent_failures_are_all_counted() {
        let mut s = spec(1000);
        s.breaker.failure_window = Duration::from_secs(3600);
        let cb = Arc::new(CircuitBreaker::new(&s, t0()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = Arc::clone(&cb);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let p = match cb.allow(t0()) {
                            Admission::Permit(p) => p,
                            Admission::Denied(d) => panic!("unexpected denial {d:?}"),
                        };
                        cb.report(p, Outcome::Failure, t0());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cb.snapshot(t0()).failure_count, 400);
    }
}
