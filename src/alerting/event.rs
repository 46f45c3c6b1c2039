//! Alert events and severity classification

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use toolguard_core::{HealthStatus, Severity};
use uuid::Uuid;

/// A health status change worth telling someone about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    /// Unique event id
    pub id: Uuid,
    /// Tool id
    pub tool_id: String,
    /// Status before the change
    pub old_status: HealthStatus,
    /// Status after the change
    pub new_status: HealthStatus,
    /// Derived severity
    pub severity: Severity,
    /// Tool's criticality tier (1 is most critical)
    pub tier: u8,
    /// When the change was observed
    pub timestamp: DateTime<Utc>,
    /// Human-readable explanation
    pub rationale: String,
}

impl AlertEvent {
    /// Build an event for a status change, or `None` if the status did not change
    #[must_use]
    pub fn for_transition(
        tool_id: &str,
        tier: u8,
        old_status: HealthStatus,
        new_status: HealthStatus,
        timestamp: DateTime<Utc>,
        rationale: impl Into<String>,
    ) -> Option<Self> {
        let severity = classify(old_status, new_status, tier)?;
        Some(Self {
            id: Uuid::new_v4(),
            tool_id: tool_id.to_string(),
            old_status,
            new_status,
            severity,
            tier,
            timestamp,
            rationale: rationale.into(),
        })
    }

    /// Whether health got worse
    #[must_use]
    pub fn is_escalation(&self) -> bool {
        is_escalation(self.old_status, self.new_status)
    }
}

// UNAVAILABLE means "no data", not "worse than CRITICAL": leaving it for
// anything but HEALTHY is an escalation.
fn is_escalation(old: HealthStatus, new: HealthStatus) -> bool {
    match old {
        HealthStatus::Unavailable => new != HealthStatus::Healthy && new != old,
        _ => new > old,
    }
}

/// Severity of a status change on a tool of the given tier.
///
/// Depends only on the direction of the change and the tier. Recoveries are
/// `Info`; an unchanged status yields `None`. `UNAVAILABLE` has no direction
/// of its own, so moving from it to `DEGRADED` or `CRITICAL` escalates.
#[must_use]
pub fn classify(old: HealthStatus, new: HealthStatus, tier: u8) -> Option<Severity> {
    if new == old {
        return None;
    }
    if !is_escalation(old, new) {
        return Some(Severity::Info);
    }
    let severity = if new.is_failing() {
        match tier {
            1 => Severity::Critical,
            2 => Severity::High,
            _ => Severity::Medium,
        }
    } else {
        match tier {
            1 | 2 => Severity::High,
            _ => Severity::Low,
        }
    };
    Some(severity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use HealthStatus::{Critical, Degraded, Healthy, Unavailable};

    #[test]
    fn tier_one_failure_is_critical() {
        assert_eq!(classify(Healthy, Critical, 1), Some(Severity::Critical));
        assert_eq!(classify(Degraded, Unavailable, 1), Some(Severity::Critical));
    }

    #[test]
    fn failure_severity_drops_with_tier() {
        assert_eq!(classify(Healthy, Critical, 2), Some(Severity::High));
        assert_eq!(classify(Healthy, Critical, 3), Some(Severity::Medium));
    }

    #[test]
    fn degradation_is_high_on_important_tools() {
        assert_eq!(classify(Healthy, Degraded, 1), Some(Severity::High));
        assert_eq!(classify(Healthy, Degraded, 2), Some(Severity::High));
        assert_eq!(classify(Healthy, Degraded, 3), Some(Severity::Low));
    }

    #[test]
    fn recovery_is_informational() {
        assert_eq!(classify(Critical, Healthy, 1), Some(Severity::Info));
        assert_eq!(classify(Unavailable, Healthy, 1), Some(Severity::Info));
    }

    #[test]
    fn leaving_unavailable_for_bad_health_escalates() {
        assert_eq!(classify(Unavailable, Critical, 1), Some(Severity::Critical));
        assert_eq!(classify(Unavailable, Degraded, 2), Some(Severity::High));
    }

    #[test]
    fn no_change_no_alert() {
        assert_eq!(classify(Degraded, Degraded, 1), None);
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert!(AlertEvent::for_transition("x", 1, Healthy, Healthy, now, "").is_none());
    }

    #[test]
    fn event_carries_direction() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let event = AlertEvent::for_transition("x", 1, Healthy, Critical, now, "score 0.40").unwrap();
        assert!(event.is_escalation());
        assert_eq!(event.severity, Severity::Critical);
    }
}
