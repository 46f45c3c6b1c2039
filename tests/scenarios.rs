//! End-to-end reliability scenarios driven through the `Monitor` facade
//! with a manual clock

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use toolguard::clock::ManualClock;
use toolguard::config::Config;
use toolguard::failsafe::{Admission, DenyReason, FallbackContext, FallbackOutcome, FallbackReason, Permit};
use toolguard::{BreakerPhase, Error, HealthStatus, Monitor, MonitorBuilder, Outcome};

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn build(yaml: &str) -> (Monitor, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let monitor = MonitorBuilder::new(Config::from_yaml(yaml).unwrap())
        .clock(clock.clone())
        .alert_sinks(Vec::new())
        .build()
        .unwrap();
    (monitor, clock)
}

fn grant(monitor: &Monitor, tool: &str) -> Permit {
    match monitor.allow(tool).unwrap() {
        Admission::Permit(p) => p,
        Admission::Denied(d) => panic!("unexpected denial: {d:?}"),
    }
}

fn fail(monitor: &Monitor, tool: &str) {
    let permit = grant(monitor, tool);
    monitor
        .record_and_score(permit, Outcome::Failure, Duration::from_millis(40))
        .unwrap();
}

fn succeed(monitor: &Monitor, tool: &str) {
    let permit = grant(monitor, tool);
    monitor
        .record_and_score(permit, Outcome::Success, Duration::from_millis(40))
        .unwrap();
}

fn phase(monitor: &Monitor, tool: &str) -> BreakerPhase {
    monitor.dashboard_snapshot()[tool].breaker_phase
}

const SOLVER: &str = r"
tools:
  - id: schedule-solver
    breaker:
      failure_threshold: 5
      failure_window: 60s
";

#[test]
fn scenario_a_threshold_reached_denies_next_call() {
    let (monitor, clock) = build(SOLVER);

    // GIVEN: five failures spread over ten seconds
    for _ in 0..4 {
        fail(&monitor, "schedule-solver");
        clock.advance(Duration::from_millis(2500));
    }
    assert_eq!(phase(&monitor, "schedule-solver"), BreakerPhase::Closed);
    fail(&monitor, "schedule-solver");

    // WHEN: the very next call asks for admission
    let admission = monitor.allow("schedule-solver").unwrap();

    // THEN: it is refused for the default 30s recovery timeout
    let Admission::Denied(denial) = admission else {
        panic!("breaker should be open after the fifth failure");
    };
    assert_eq!(denial.reason, DenyReason::Open);
    assert_eq!(denial.retry_after, Duration::from_secs(30));
}

#[test]
fn scenario_b_successful_probe_closes_and_resets() {
    let (monitor, clock) = build(SOLVER);
    for _ in 0..5 {
        fail(&monitor, "schedule-solver");
    }
    assert_eq!(phase(&monitor, "schedule-solver"), BreakerPhase::Open);

    // GIVEN: the recovery timeout has elapsed
    clock.advance(Duration::from_secs(30));

    // WHEN: the single probe succeeds
    let probe = grant(&monitor, "schedule-solver");
    assert!(probe.is_probe());
    monitor
        .record_and_score(probe, Outcome::Success, Duration::from_millis(40))
        .unwrap();

    // THEN: the breaker is closed with a clean slate
    let row = &monitor.dashboard_snapshot()["schedule-solver"];
    assert_eq!(row.breaker_phase, BreakerPhase::Closed);
    assert_eq!(row.breaker.failure_count, 0);
    assert_eq!(row.breaker.consecutive_opens, 0);

    // AND: a burst below the threshold does not reopen it
    for _ in 0..4 {
        fail(&monitor, "schedule-solver");
    }
    assert_eq!(phase(&monitor, "schedule-solver"), BreakerPhase::Closed);
    assert!(monitor.allow("schedule-solver").unwrap().is_permitted());
}

#[tokio::test]
async fn scenario_c_open_breaker_falls_back_to_cache() {
    let (monitor, clock) = build(
        r"
tools:
  - id: acgme-validator
    max_staleness: 24h
",
    );
    let cached = json!({ "violations": [] });
    monitor
        .cache()
        .set("acgme-validator", cached.clone(), t0())
        .await
        .unwrap();

    // GIVEN: the breaker opened two hours after the result was cached
    clock.advance(Duration::from_secs(2 * 3600));
    for _ in 0..5 {
        fail(&monitor, "acgme-validator");
    }
    let Admission::Denied(denial) = monitor.allow("acgme-validator").unwrap() else {
        panic!("expected denial");
    };

    // WHEN
    let outcome = monitor
        .resolve(
            "acgme-validator",
            FallbackReason::Denied(denial),
            &FallbackContext::required(json!({})),
        )
        .await
        .unwrap();

    // THEN
    assert!(outcome.is_degraded());
    match outcome {
        FallbackOutcome::Cached { result, age, reason } => {
            assert_eq!(result, cached);
            assert_eq!(age, Duration::from_secs(2 * 3600));
            assert!(reason.starts_with("using 2h-old cached result"), "{reason}");
            assert!(reason.contains("breaker OPEN since"), "{reason}");
        }
        other => panic!("expected cached result, got {other:?}"),
    }
}

#[tokio::test]
async fn scenario_d_stale_cache_on_abort_tier_aborts() {
    let (monitor, clock) = build(
        r"
tools:
  - id: coverage-calculator
    criticality: abort
    max_staleness: 1h
",
    );
    monitor
        .cache()
        .set("coverage-calculator", json!({ "coverage": 0.93 }), t0())
        .await
        .unwrap();

    // GIVEN: the only cached result is older than max_staleness
    clock.advance(Duration::from_secs(3 * 3600));
    for _ in 0..5 {
        fail(&monitor, "coverage-calculator");
    }
    let Admission::Denied(denial) = monitor.allow("coverage-calculator").unwrap() else {
        panic!("expected denial");
    };

    // WHEN: even an optional caller asks for a fallback
    let outcome = monitor
        .resolve(
            "coverage-calculator",
            FallbackReason::Denied(denial),
            &FallbackContext::optional(json!({})),
        )
        .await
        .unwrap();

    // THEN: abort-tier tools are never skipped
    match outcome {
        FallbackOutcome::Aborted {
            error: Error::FallbackExhausted { tool, reason },
        } => {
            assert_eq!(tool, "coverage-calculator");
            assert!(reason.contains("cache"), "{reason}");
        }
        other => panic!("expected FallbackExhausted, got {other:?}"),
    }
}

#[test]
fn scenario_e_critical_dependency_caps_dependent() {
    let (monitor, _clock) = build(
        r"
tools:
  - id: roster-export
    dependencies: [database]
  - id: database
    tier: 1
",
    );

    // GIVEN: the dependency fails every call
    for _ in 0..3 {
        fail(&monitor, "database");
    }
    assert_eq!(monitor.score("database").unwrap().status, HealthStatus::Critical);

    // WHEN: the dependent has nothing but fast successes
    for _ in 0..20 {
        succeed(&monitor, "roster-export");
    }
    let snapshot = monitor.score("roster-export").unwrap();

    // THEN: it is capped at DEGRADED
    assert!(snapshot.score > 0.99, "own score {}", snapshot.score);
    assert_eq!(snapshot.status, HealthStatus::Degraded);
    assert_eq!(snapshot.capped_by, vec!["database".to_string()]);
}

#[test]
fn empty_window_is_never_healthy() {
    let (monitor, _clock) = build(SOLVER);
    let snapshot = monitor.score("schedule-solver").unwrap();
    assert_eq!(snapshot.status, HealthStatus::Unavailable);
    assert_eq!(snapshot.score, 0.0);
}
