//! Telemetry and audit logging for portsync.
//!
//! # Architecture
//!
//! - **Operational logging** (tracing): every rule change and every
//!   reconciliation pass is logged to stderr via `tracing`
//! - **Audit logging** (syslog, optional): rule changes are also written to
//!   syslog as JSON so a host keeps a record of what was exposed and when
//!
//! # Event Format
//!
//! Audit events are logged as JSON with an ISO8601 timestamp:
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"forward_added","protocol":"tcp","local_port":8080,"remote_address":"172.17.0.2","remote_port":80}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::{AuditEvent, TimestampedEvent};
pub use syslog::{AuditLogger, SYSLOG_TAG};
