//! Reconciliation of forwarding rules against running containers.
//!
//! A pass lists the running containers, computes the rules they publish
//! ([`collect_desired`]) and applies the difference to the forwarder
//! ([`Reconciler::reconcile`]). Passes are requested through a
//! [`TriggerQueue`] fed by a heartbeat and, optionally, container events.

mod collector;
mod reconciler;
mod trigger;

pub use collector::{CollectorError, CollectorResult, DesiredState, collect_desired};
pub use reconciler::{DEFAULT_REQUEST_TIMEOUT, ReconcileError, ReconcileResult, Reconciler};
pub use trigger::{
    DEFAULT_ACTIONS, Trigger, TriggerMode, TriggerQueue, TriggerSender, run_event_watcher,
    run_heartbeat, trigger_queue,
};
