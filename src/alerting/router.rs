//! Alert routing: suppression, batching, fan-out and delivery retry
//!
//! `notify` never awaits. Immediate alerts go straight onto each matching
//! destination's queue, batched ones wait for `flush_digest`. Every
//! destination has its own queue and delivery task, so a slow or failing
//! webhook only delays itself.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use toolguard_core::Severity;
use tracing::{debug, error, info, warn};

use super::event::AlertEvent;
use super::sink::{AlertSink, Notification};
use crate::clock::elapsed;
use crate::config::{AlertingConfig, DestinationConfig};
use crate::failsafe::{RetryPolicy, with_retry};

/// What `notify` did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Queued for immediate delivery
    Immediate,
    /// Held for the next digest
    Batched,
    /// Dropped by the re-notification interval
    Suppressed,
}

struct Destination {
    config: DestinationConfig,
    // None once the router is closed
    tx: Mutex<Option<mpsc::UnboundedSender<Notification>>>,
}

struct Worker {
    sink: Arc<dyn AlertSink>,
    rx: mpsc::UnboundedReceiver<Notification>,
}

#[derive(Default)]
struct RouterState {
    last_sent: HashMap<String, (DateTime<Utc>, Severity)>,
    last_alert: HashMap<String, AlertEvent>,
    pending: Vec<AlertEvent>,
    outbox: VecDeque<AlertEvent>,
}

/// Delivery counters
#[derive(Debug, Default)]
pub struct DeliveryStats {
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl DeliveryStats {
    /// Notifications delivered
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Notifications dropped after exhausting retries
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Router counters for the dashboard
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    /// Events accepted into the outbox
    pub outbox: usize,
    /// Events waiting for the next digest
    pub pending_digest: usize,
    /// Notifications delivered
    pub delivered: u64,
    /// Notifications dropped after retries
    pub failed: u64,
}

/// Classifies, throttles and fans out alert events
pub struct AlertRouter {
    config: AlertingConfig,
    destinations: Vec<Destination>,
    workers: Mutex<Vec<Worker>>,
    state: Mutex<RouterState>,
    stats: Arc<DeliveryStats>,
}

impl std::fmt::Debug for AlertRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertRouter")
            .field("destinations", &self.destinations.len())
            .finish_non_exhaustive()
    }
}

impl AlertRouter {
    /// Create a router over `sinks`, one per destination.
    ///
    /// Notifications queue until [`AlertRouter::start`] spawns the delivery
    /// tasks.
    pub fn new(config: AlertingConfig, sinks: Vec<(DestinationConfig, Arc<dyn AlertSink>)>) -> Self {
        let mut destinations = Vec::with_capacity(sinks.len());
        let mut workers = Vec::with_capacity(sinks.len());
        for (dest, sink) in sinks {
            let (tx, rx) = mpsc::unbounded_channel();
            destinations.push(Destination {
                config: dest,
                tx: Mutex::new(Some(tx)),
            });
            workers.push(Worker { sink, rx });
        }
        Self {
            config,
            destinations,
            workers: Mutex::new(workers),
            state: Mutex::new(RouterState::default()),
            stats: Arc::new(DeliveryStats::default()),
        }
    }

    /// Spawn one delivery task per destination. Later calls are no-ops.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let workers = std::mem::take(&mut *self.workers.lock());
        let policy = RetryPolicy::new(&self.config.delivery);
        workers
            .into_iter()
            .map(|worker| {
                let policy = policy.clone();
                let stats = Arc::clone(&self.stats);
                tokio::spawn(deliver_loop(worker, policy, stats))
            })
            .collect()
    }

    /// Route one event
    pub fn notify(&self, event: AlertEvent) -> Dispatch {
        let mut state = self.state.lock();

        state.outbox.push_back(event.clone());
        while state.outbox.len() > self.config.outbox_capacity {
            state.outbox.pop_front();
        }
        state.last_alert.insert(event.tool_id.clone(), event.clone());

        // A more urgent alert always gets through; repeats and milder
        // follow-ups within the interval do not.
        if let Some((at, severity)) = state.last_sent.get(&event.tool_id) {
            if elapsed(*at, event.timestamp) < self.config.min_renotify_interval
                && event.severity >= *severity
            {
                debug!(
                    tool = %event.tool_id,
                    severity = %event.severity,
                    "Alert suppressed by re-notification interval"
                );
                telemetry_metrics::counter!("toolguard_alerts_suppressed_total").increment(1);
                return Dispatch::Suppressed;
            }
        }
        state
            .last_sent
            .insert(event.tool_id.clone(), (event.timestamp, event.severity));

        telemetry_metrics::counter!(
            "toolguard_alerts_total",
            "severity" => event.severity.to_string()
        )
        .increment(1);

        if event.severity.is_immediate() {
            drop(state);
            let severity = event.severity;
            self.fan_out(&Notification::Alert(event), |dest| dest.accepts(severity));
            Dispatch::Immediate
        } else {
            state.pending.push(event);
            Dispatch::Batched
        }
    }

    /// Send everything batched so far as one digest per destination
    pub fn flush_digest(&self, now: DateTime<Utc>) -> usize {
        let pending = std::mem::take(&mut self.state.lock().pending);
        if pending.is_empty() {
            return 0;
        }
        for dest in &self.destinations {
            let events: Vec<AlertEvent> = pending
                .iter()
                .filter(|e| dest.config.accepts(e.severity))
                .cloned()
                .collect();
            if events.is_empty() {
                continue;
            }
            Self::enqueue(dest, Notification::Digest {
                events,
                flushed_at: now,
            });
        }
        debug!(events = pending.len(), "Alert digest flushed");
        pending.len()
    }

    /// Close every destination queue. Delivery tasks finish what is already
    /// queued and then stop; later notifications are dropped.
    pub fn close(&self) {
        for dest in &self.destinations {
            dest.tx.lock().take();
        }
    }

    /// Flush the pending digest, close the queues and wait up to `grace` for
    /// the delivery tasks in `handles` to drain.
    ///
    /// Returns `true` when every task finished in time.
    pub async fn shutdown(
        &self,
        now: DateTime<Utc>,
        handles: Vec<JoinHandle<()>>,
        grace: Duration,
    ) -> bool {
        let flushed = self.flush_digest(now);
        self.close();
        if timeout(grace, join_all(handles)).await.is_ok() {
            info!(flushed, delivered = self.stats.delivered(), "Alert queues drained");
            true
        } else {
            warn!(
                grace_ms = grace.as_millis(),
                "Alert delivery still running at shutdown, abandoning queued notifications"
            );
            false
        }
    }

    /// Most recent event for a tool, suppressed or not
    #[must_use]
    pub fn last_alert(&self, tool_id: &str) -> Option<AlertEvent> {
        self.state.lock().last_alert.get(tool_id).cloned()
    }

    /// Accepted events, oldest first
    #[must_use]
    pub fn outbox(&self) -> Vec<AlertEvent> {
        self.state.lock().outbox.iter().cloned().collect()
    }

    /// Forget a tool's throttling state (admin reset)
    pub fn reset_tool(&self, tool_id: &str) {
        self.state.lock().last_sent.remove(tool_id);
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        let state = self.state.lock();
        RouterStats {
            outbox: state.outbox.len(),
            pending_digest: state.pending.len(),
            delivered: self.stats.delivered(),
            failed: self.stats.failed(),
        }
    }

    fn fan_out(&self, notification: &Notification, accepts: impl Fn(&DestinationConfig) -> bool) {
        for dest in self.destinations.iter().filter(|d| accepts(&d.config)) {
            Self::enqueue(dest, notification.clone());
        }
    }

    fn enqueue(dest: &Destination, notification: Notification) {
        let tx = dest.tx.lock();
        let Some(tx) = tx.as_ref() else {
            warn!(destination = %dest.config.name, "Alert router closed, notification dropped");
            return;
        };
        if tx.send(notification).is_err() {
            warn!(destination = %dest.config.name, "Delivery task gone, notification dropped");
        }
    }
}

async fn deliver_loop(mut worker: Worker, policy: RetryPolicy, stats: Arc<DeliveryStats>) {
    let name = worker.sink.name().to_string();
    while let Some(notification) = worker.rx.recv().await {
        let sink = Arc::clone(&worker.sink);
        let result = with_retry(&policy, None, &name, crate::Error::is_retryable, || {
            let sink = Arc::clone(&sink);
            let notification = notification.clone();
            async move { sink.send(&notification).await }
        })
        .await;

        match result {
            Ok(_) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(failure) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                telemetry_metrics::counter!(
                    "toolguard_alert_delivery_failures_total",
                    "destination" => name.clone()
                )
                .increment(1);
                error!(
                    destination = %name,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "Alert delivery failed"
                );
            }
        }
    }
    debug!(destination = %name, "Delivery task stopped");
}
