//! Configuration schema definitions.
//!
//! Every setting is optional in a file. Layers are merged with
//! [`Config::merge`], where a value set in a later layer overrides the
//! earlier one, and the accessors fill in defaults for anything no layer set.
//!
//! ```toml
//! [general]
//! log_level = "info"
//!
//! [trigger]
//! mode = "events"
//! poll_interval_secs = 5
//! heartbeat_interval_secs = 20
//! resubscribe_delay_secs = 2
//! actions = ["start", "stop", "kill", "pause", "unpause", "restart", "update"]
//!
//! [forwarding]
//! bind_address = "127.0.0.1"
//! connect_timeout_ms = 5000
//! udp_session_timeout_secs = 30
//!
//! [runtime]
//! request_timeout_secs = 10
//!
//! [telemetry]
//! syslog = false
//! ```

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use crate::forwarding::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_UDP_SESSION_TIMEOUT, EngineOptions};
use crate::reconcile::{DEFAULT_ACTIONS, DEFAULT_REQUEST_TIMEOUT, TriggerMode};

/// Default log level when neither `RUST_LOG` nor `-v` is given.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default heartbeat period in polling mode.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default heartbeat period in events mode.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Default pause before re-subscribing to container events.
pub const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

/// Default host address forwarded ports bind to.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// When passes run.
    #[serde(default)]
    pub trigger: TriggerConfig,

    /// Forwarding engine settings.
    #[serde(default)]
    pub forwarding: ForwardingConfig,

    /// Container runtime settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Audit trail settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Merge another config into this one. Values set in `other` win.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.trigger.merge(other.trigger);
        self.forwarding.merge(other.forwarding);
        self.runtime.merge(other.runtime);
        self.telemetry.merge(other.telemetry);
    }

    /// Check the effective values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("trigger.poll_interval_secs", self.trigger.poll_interval())?;
        non_zero("trigger.heartbeat_interval_secs", self.trigger.heartbeat_interval())?;
        non_zero("trigger.resubscribe_delay_secs", self.trigger.resubscribe_delay())?;
        non_zero("forwarding.connect_timeout_ms", self.forwarding.connect_timeout())?;
        non_zero(
            "forwarding.udp_session_timeout_secs",
            self.forwarding.udp_session_timeout(),
        )?;
        non_zero("runtime.request_timeout_secs", self.runtime.request_timeout())?;
        self.forwarding.bind_address()?;

        if self.trigger.actions().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "trigger.actions".to_string(),
                message: "at least one action is required".to_string(),
            });
        }

        Ok(())
    }
}

fn non_zero(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Override `target` when `value` is set.
fn set<T>(target: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *target = value;
    }
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub log_level: Option<String>,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        set(&mut self.log_level, other.log_level.filter(|l| !l.is_empty()));
    }

    /// Effective log level.
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }
}

/// Trigger settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TriggerConfig {
    /// `polling` or `events`.
    #[serde(default)]
    pub mode: Option<TriggerMode>,

    /// Heartbeat period in polling mode, in seconds.
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,

    /// Heartbeat period in events mode, in seconds.
    #[serde(default)]
    pub heartbeat_interval_secs: Option<u64>,

    /// Pause before re-subscribing to events after a failure, in seconds.
    #[serde(default)]
    pub resubscribe_delay_secs: Option<u64>,

    /// Container actions that trigger a pass. Replaces the default set.
    #[serde(default)]
    pub actions: Option<Vec<String>>,
}

impl TriggerConfig {
    fn merge(&mut self, other: TriggerConfig) {
        set(&mut self.mode, other.mode);
        set(&mut self.poll_interval_secs, other.poll_interval_secs);
        set(&mut self.heartbeat_interval_secs, other.heartbeat_interval_secs);
        set(&mut self.resubscribe_delay_secs, other.resubscribe_delay_secs);
        set(&mut self.actions, other.actions);
    }

    /// Effective trigger mode.
    pub fn mode(&self) -> TriggerMode {
        self.mode.unwrap_or_default()
    }

    /// Effective polling-mode heartbeat period.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval_secs
            .map_or(DEFAULT_POLL_INTERVAL, Duration::from_secs)
    }

    /// Effective events-mode heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval_secs
            .map_or(DEFAULT_HEARTBEAT_INTERVAL, Duration::from_secs)
    }

    /// Heartbeat period for the effective mode.
    pub fn heartbeat_for_mode(&self) -> Duration {
        match self.mode() {
            TriggerMode::Polling => self.poll_interval(),
            TriggerMode::Events => self.heartbeat_interval(),
        }
    }

    /// Effective re-subscribe delay.
    pub fn resubscribe_delay(&self) -> Duration {
        self.resubscribe_delay_secs
            .map_or(DEFAULT_RESUBSCRIBE_DELAY, Duration::from_secs)
    }

    /// Effective set of triggering actions.
    pub fn actions(&self) -> HashSet<String> {
        match &self.actions {
            Some(actions) => actions
                .iter()
                .map(|a| a.trim().to_lowercase())
                .filter(|a| !a.is_empty())
                .collect(),
            None => DEFAULT_ACTIONS.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Forwarding engine settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ForwardingConfig {
    /// Host address forwarded ports bind to.
    #[serde(default)]
    pub bind_address: Option<String>,

    /// Timeout for connecting to a TCP destination, in milliseconds.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,

    /// Idle timeout of a UDP client session, in seconds.
    #[serde(default)]
    pub udp_session_timeout_secs: Option<u64>,
}

impl ForwardingConfig {
    fn merge(&mut self, other: ForwardingConfig) {
        set(&mut self.bind_address, other.bind_address);
        set(&mut self.connect_timeout_ms, other.connect_timeout_ms);
        set(&mut self.udp_session_timeout_secs, other.udp_session_timeout_secs);
    }

    /// Effective bind address.
    pub fn bind_address(&self) -> Result<IpAddr, ConfigError> {
        let raw = self.bind_address.as_deref().unwrap_or(DEFAULT_BIND_ADDRESS);
        raw.trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                field: "forwarding.bind_address".to_string(),
                message: format!("'{}' is not an IP address", raw),
            })
    }

    /// Effective TCP connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout_ms
            .map_or(DEFAULT_CONNECT_TIMEOUT, Duration::from_millis)
    }

    /// Effective UDP session timeout.
    pub fn udp_session_timeout(&self) -> Duration {
        self.udp_session_timeout_secs
            .map_or(DEFAULT_UDP_SESSION_TIMEOUT, Duration::from_secs)
    }

    /// Options for the concrete engines.
    pub fn engine_options(&self) -> Result<EngineOptions, ConfigError> {
        Ok(EngineOptions {
            bind_address: self.bind_address()?,
            connect_timeout: self.connect_timeout(),
            udp_session_timeout: self.udp_session_timeout(),
        })
    }
}

/// Container runtime settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RuntimeConfig {
    /// Bound on each runtime request, in seconds.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl RuntimeConfig {
    fn merge(&mut self, other: RuntimeConfig) {
        set(&mut self.request_timeout_secs, other.request_timeout_secs);
    }

    /// Effective request timeout.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout_secs
            .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_secs)
    }
}

/// Audit trail settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TelemetryConfig {
    /// Send audit events to syslog.
    #[serde(default)]
    pub syslog: Option<bool>,
}

impl TelemetryConfig {
    fn merge(&mut self, other: TelemetryConfig) {
        set(&mut self.syslog, other.syslog);
    }

    /// Whether the syslog audit trail is enabled.
    pub fn syslog(&self) -> bool {
        self.syslog.unwrap_or(false)
    }
}
