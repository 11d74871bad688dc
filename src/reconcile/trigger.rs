//! Reconciliation triggers.
//!
//! Heartbeats and container lifecycle events both end up as requests on a
//! [`TriggerQueue`] of capacity one. A request made while another is still
//! pending is dropped, so a burst of events costs a single extra pass.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use clap::ValueEnum;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::runtime::ContainerRuntime;

/// Container actions that trigger a pass by default.
pub const DEFAULT_ACTIONS: [&str; 7] = [
    "start", "stop", "kill", "pause", "unpause", "restart", "update",
];

/// How passes are triggered.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Heartbeat only, at the poll interval.
    Polling,
    /// Container events plus a slower heartbeat.
    #[default]
    Events,
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerMode::Polling => f.write_str("polling"),
            TriggerMode::Events => f.write_str("events"),
        }
    }
}

/// Why a pass was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// The daemon just started.
    Startup,
    /// Periodic timer.
    Heartbeat,
    /// A container lifecycle event.
    Event {
        /// The event action (e.g. "start").
        action: String,
    },
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Startup => f.write_str("startup"),
            Trigger::Heartbeat => f.write_str("heartbeat"),
            Trigger::Event { action } => write!(f, "container {}", action),
        }
    }
}

/// Create a connected sender and queue.
pub fn trigger_queue() -> (TriggerSender, TriggerQueue) {
    let (tx, rx) = mpsc::channel(1);
    (TriggerSender { tx }, TriggerQueue { rx })
}

/// Requests passes. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TriggerSender {
    tx: mpsc::Sender<Trigger>,
}

impl TriggerSender {
    /// Request a pass. A request made while one is pending is coalesced into
    /// it. Returns `false` once the queue has been dropped.
    pub fn request(&self, trigger: Trigger) -> bool {
        match self.tx.try_send(trigger) {
            Ok(()) => true,
            Err(TrySendError::Full(trigger)) => {
                trace!("Pass already pending, coalescing {} trigger", trigger);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Receiving end of pass requests.
#[derive(Debug)]
pub struct TriggerQueue {
    rx: mpsc::Receiver<Trigger>,
}

impl TriggerQueue {
    /// Wait for the next request. `None` once every sender is gone.
    pub async fn next(&mut self) -> Option<Trigger> {
        self.rx.recv().await
    }
}

/// Resolve once shutdown is signalled or the signal sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Request a pass immediately and then every `period` until shutdown.
pub async fn run_heartbeat(
    period: Duration,
    sender: TriggerSender,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !sender.request(Trigger::Heartbeat) {
                    break;
                }
            }
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }
    debug!("Heartbeat stopped");
}

/// Request a pass for every container event whose action is in `actions`.
///
/// A failed or finished subscription is replaced after `resubscribe_delay`.
pub async fn run_event_watcher<R: ContainerRuntime>(
    runtime: R,
    actions: HashSet<String>,
    sender: TriggerSender,
    mut shutdown: watch::Receiver<bool>,
    resubscribe_delay: Duration,
) {
    'subscribe: loop {
        let mut events = runtime.subscribe_events();
        debug!("Subscribed to container events");

        loop {
            tokio::select! {
                item = events.next() => match item {
                    Some(Ok(event)) => {
                        if !event.is_container() || !actions.contains(&event.action) {
                            trace!("Ignoring {} event {}", event.resource_type, event.action);
                            continue;
                        }
                        debug!("Container event: {}", event.action);
                        if !sender.request(Trigger::Event { action: event.action }) {
                            break 'subscribe;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Container event subscription failed: {}", e);
                        break;
                    }
                    None => {
                        warn!("Container event subscription ended");
                        break;
                    }
                },
                _ = wait_for_shutdown(&mut shutdown) => break 'subscribe,
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(resubscribe_delay) => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }
    debug!("Event watcher stopped");
}
