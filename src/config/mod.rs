//! Configuration system for portsync.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/portsync/config.toml`
//! 3. User config: `~/.config/portsync/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! No configuration file is required; missing system and user files are
//! skipped.
//!
//! # Merge Behavior
//!
//! A value set in a later source overrides the earlier one. Lists (such as
//! `trigger.actions`) are replaced as a whole.

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{ConfigLoader, SYSTEM_CONFIG_PATH, USER_CONFIG_DIR, USER_CONFIG_FILE};
pub use schema::{
    Config, DEFAULT_BIND_ADDRESS, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_LOG_LEVEL,
    DEFAULT_POLL_INTERVAL, DEFAULT_RESUBSCRIBE_DELAY, ForwardingConfig, GeneralConfig,
    RuntimeConfig, TelemetryConfig, TriggerConfig,
};
