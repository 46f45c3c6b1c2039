//! Per-tool sample history
//!
//! Each tool owns a ring buffer bounded both by count and by age. Expired
//! samples are evicted lazily whenever the buffer is touched, so there is no
//! background sweep. Buffers live behind their own mutex; the map only hands
//! out `Arc`s, so completions for different tools never wait on each other.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use toolguard_core::Outcome;

use crate::clock::elapsed;
use crate::config::ToolSpec;

/// One recorded invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sample {
    /// Completion time
    pub at: DateTime<Utc>,
    /// Observed latency
    pub latency: Duration,
    /// Result classification
    pub outcome: Outcome,
}

/// Bounded, time-windowed sample buffer for a single tool
#[derive(Debug)]
pub struct SampleWindow {
    entries: VecDeque<Sample>,
    max_samples: usize,
    max_age: Duration,
}

impl SampleWindow {
    /// Create a new window
    #[must_use]
    pub fn new(max_samples: usize, max_age: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_samples.min(4096)),
            max_samples,
            max_age,
        }
    }

    /// Append a sample, evicting expired and overflowing entries
    pub fn record(&mut self, sample: Sample) {
        self.evict_old(sample.at);
        self.entries.push_back(sample);
        while self.entries.len() > self.max_samples {
            self.entries.pop_front();
        }
    }

    /// Samples that are neither expired nor from the future relative to `now`
    pub fn live(&mut self, now: DateTime<Utc>) -> Vec<Sample> {
        self.evict_old(now);
        self.entries
            .iter()
            .filter(|s| s.at <= now && elapsed(s.at, now) <= self.max_age)
            .copied()
            .collect()
    }

    /// Number of buffered entries, expired or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything (admin reset)
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    // Completions can land slightly out of order, so the front is only
    // approximately the oldest entry; `live` filters exactly.
    fn evict_old(&mut self, now: DateTime<Utc>) {
        while let Some(front) = self.entries.front() {
            if front.at <= now && elapsed(front.at, now) > self.max_age {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Immutable view over a tool's live samples.
///
/// Iterate it as many times as needed; each pass yields the same samples.
#[derive(Debug, Clone, Default)]
pub struct WindowView {
    samples: Vec<Sample>,
}

impl WindowView {
    /// Iterate the samples oldest first
    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    /// Number of live samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether there are no live samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Most recent error outcome, if any
    #[must_use]
    pub fn last_error_at(&self) -> Option<DateTime<Utc>> {
        self.samples
            .iter()
            .filter(|s| s.outcome.is_error())
            .map(|s| s.at)
            .max()
    }
}

impl<'a> IntoIterator for &'a WindowView {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}

/// Records invocation outcomes into per-tool windows
#[derive(Debug, Default)]
pub struct SampleRecorder {
    windows: DashMap<String, Arc<Mutex<SampleWindow>>>,
}

impl SampleRecorder {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Append an outcome to `spec.id`'s window, creating it on first use
    pub fn record(&self, spec: &ToolSpec, at: DateTime<Utc>, latency: Duration, outcome: Outcome) {
        let window = self.window_for(spec);
        window.lock().record(Sample {
            at,
            latency,
            outcome,
        });
        tracing::trace!(tool = %spec.id, ?outcome, latency_ms = latency.as_millis(), "Sample recorded");
    }

    /// Live samples for `tool_id` as of `now`; empty for tools never called
    pub fn window(&self, tool_id: &str, now: DateTime<Utc>) -> WindowView {
        let Some(window) = self.windows.get(tool_id).map(|w| Arc::clone(w.value())) else {
            return WindowView::default();
        };
        let samples = window.lock().live(now);
        WindowView { samples }
    }

    /// Drop a tool's history
    pub fn reset(&self, tool_id: &str) {
        if let Some(window) = self.windows.get(tool_id) {
            window.lock().reset();
        }
    }

    fn window_for(&self, spec: &ToolSpec) -> Arc<Mutex<SampleWindow>> {
        self.windows
            .entry(spec.id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SampleWindow::new(
                    spec.health.window_capacity,
                    spec.health.window_max_age,
                )))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::to_chrono;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn sample(at: DateTime<Utc>, outcome: Outcome) -> Sample {
        Sample {
            at,
            latency: Duration::from_millis(10),
            outcome,
        }
    }

    #[test]
    fn capacity_keeps_newest() {
        let mut window = SampleWindow::new(3, Duration::from_secs(60));
        for i in 0..5 {
            window.record(sample(t0() + chrono::Duration::seconds(i), Outcome::Success));
        }
        let live = window.live(t0() + chrono::Duration::seconds(5));
        assert_eq!(live.len(), 3);
        assert_eq!(live[0].at, t0() + chrono::Duration::seconds(2));
    }

    #[test]
    fn expired_samples_are_pruned_on_read() {
        let mut window = SampleWindow::new(100, Duration::from_secs(60));
        window.record(sample(t0(), Outcome::Failure));
        window.record(sample(t0() + chrono::Duration::seconds(30), Outcome::Success));

        let live = window.live(t0() + chrono::Duration::seconds(61));
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].outcome, Outcome::Success);
        assert_eq!(window.len(), 1, "expired entry evicted, not just filtered");
    }

    #[test]
    fn future_samples_are_ignored_under_skew() {
        let mut window = SampleWindow::new(100, Duration::from_secs(60));
        window.record(sample(t0() + chrono::Duration::seconds(10), Outcome::Success));
        // Reader's clock is behind the writer's.
        assert!(window.live(t0()).is_empty());
    }

    #[test]
    fn view_is_restartable() {
        let recorder = SampleRecorder::new();
        let spec = ToolSpec::with_defaults("roster");
        recorder.record(&spec, t0(), Duration::from_millis(5), Outcome::Success);
        recorder.record(&spec, t0(), Duration::from_millis(7), Outcome::Timeout);

        let view = recorder.window("roster", t0() + to_chrono(Duration::from_secs(1)));
        let first: Vec<_> = view.iter().map(|s| s.outcome).collect();
        let second: Vec<_> = (&view).into_iter().map(|s| s.outcome).collect();
        assert_eq!(first, second);
        assert_eq!(view.last_error_at(), Some(t0()));
    }

    #[test]
    fn unknown_tool_has_empty_window() {
        let recorder = SampleRecorder::new();
        assert!(recorder.window("never-called", t0()).is_empty());
    }

    #[test]
    fn reset_clears_history() {
        let recorder = SampleRecorder::new();
        let spec = ToolSpec::with_defaults("roster");
        recorder.record(&spec, t0(), Duration::from_millis(5), Outcome::Failure);
        recorder.reset("roster");
        assert!(recorder.window("roster", t0()).is_empty());
    }

    #[test]
    fn windows_are_independent_per_tool() {
        let recorder = SampleRecorder::new();
        let a = ToolSpec::with_defaults("a");
        let b = ToolSpec::with_defaults("b");
        recorder.record(&a, t0(), Duration::from_millis(5), Outcome::Failure);
        assert_eq!(recorder.window("a", t0()).len(), 1);
        assert!(recorder.window("b", t0()).is_empty());
        recorder.record(&b, t0(), Duration::from_millis(5), Outcome::Success);
        assert_eq!(recorder.window("b", t0()).len(), 1);
    }
}
