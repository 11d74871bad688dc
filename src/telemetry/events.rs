//! Audit event types for structured logging.
//!
//! These events are logged to syslog with the `PORTSYNC` tag so that every
//! forwarding change on a host leaves a trail.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::forwarding::Protocol;

/// Audit events for forwarding changes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Daemon started.
    DaemonStart {
        /// Process ID of the daemon.
        pid: u32,
        /// Trigger mode in use (polling or events).
        mode: String,
    },

    /// Daemon stopped.
    DaemonStop {
        /// Number of reconciliation passes run.
        passes: u64,
    },

    /// A forwarding rule was applied.
    ForwardAdded {
        /// Protocol of the rule.
        protocol: Protocol,
        /// Port on the host.
        local_port: u16,
        /// Destination address.
        remote_address: String,
        /// Destination port.
        remote_port: u16,
    },

    /// A forwarding rule was dropped.
    ForwardRemoved {
        /// Protocol of the rule.
        protocol: Protocol,
        /// Port on the host.
        local_port: u16,
        /// Destination address.
        remote_address: String,
        /// Destination port.
        remote_port: u16,
    },

    /// A reconciliation pass failed.
    ReconcileFailed {
        /// Error message.
        error: String,
    },
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}
