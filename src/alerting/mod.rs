//! Alerting: severity classification, routing and delivery

mod event;
mod router;
mod sink;

pub use event::{AlertEvent, classify};
pub use router::{AlertRouter, DeliveryStats, Dispatch, RouterStats};
pub use sink::{AlertSink, LogSink, Notification, WebhookSink, build_sink};

use std::sync::Arc;

use crate::Result;
use crate::config::AlertingConfig;

/// Build a router with one sink per configured destination
pub fn router_from_config(config: &AlertingConfig) -> Result<AlertRouter> {
    let sinks = config
        .destinations
        .iter()
        .map(|dest| Ok((dest.clone(), build_sink(dest)?)))
        .collect::<Result<Vec<(_, Arc<dyn AlertSink>)>>>()?;
    Ok(AlertRouter::new(config.clone(), sinks))
}
