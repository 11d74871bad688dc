//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/portsync/config.toml`
//! 3. User config: `~/.config/portsync/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::{Config, TriggerConfig};
use crate::cli::Cli;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/portsync/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "portsync";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Configuration loader with support for hierarchy merging.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
    /// Path to user configuration.
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a ConfigLoader with the default paths.
    pub fn new() -> Result<Self, ConfigError> {
        let user_config_dir = dirs::config_dir()
            .ok_or(ConfigError::NoHomeDirectory)?
            .join(USER_CONFIG_DIR);

        Ok(Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        })
    }

    /// Create a ConfigLoader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Path of the user configuration file.
    pub fn user_path(&self) -> &Path {
        &self.user_path
    }

    /// Load, merge and validate configuration from all sources.
    ///
    /// Missing system and user files are skipped. A missing `--config` file,
    /// invalid TOML and invalid values are errors.
    pub fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        if let Some(system_config) = self.load_file(&self.system_path)? {
            config.merge(system_config);
            debug!("Loaded system config from {:?}", self.system_path);
        } else {
            debug!("No system config found at {:?}", self.system_path);
        }

        if let Some(user_config) = self.load_file(&self.user_path)? {
            config.merge(user_config);
            debug!("Loaded user config from {:?}", self.user_path);
        } else {
            debug!("No user config found at {:?}", self.user_path);
        }

        if let Some(ref cli_config_path) = cli.config {
            match self.load_file(cli_config_path)? {
                Some(cli_config) => {
                    config.merge(cli_config);
                    debug!("Loaded additional config from {:?}", cli_config_path);
                }
                None => {
                    // Unlike system/user config, a missing CLI-specified config is an error
                    return Err(ConfigError::ReadError {
                        path: cli_config_path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        // CLI flags (highest priority)
        if cli.mode.is_some() {
            config.merge(Config {
                trigger: TriggerConfig {
                    mode: cli.mode,
                    ..Default::default()
                },
                ..Default::default()
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::TriggerMode;
    use std::time::Duration;
    use tempfile::tempdir;

    fn create_test_cli() -> Cli {
        Cli {
            config: None,
            mode: None,
            once: false,
            verbose: 0,
        }
    }

    fn loader_in(dir: &Path) -> ConfigLoader {
        ConfigLoader::with_paths(dir.join("system.toml"), dir.join("user.toml"))
    }

    #[test]
    fn test_missing_files_use_defaults() {
        let dir = tempdir().unwrap();
        let config = loader_in(dir.path()).load(&create_test_cli()).unwrap();

        assert_eq!(config.trigger.mode(), TriggerMode::Events);
        assert_eq!(config.trigger.heartbeat_for_mode(), Duration::from_secs(20));
    }

    #[test]
    fn test_user_config_overrides_system() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("system.toml"),
            "[trigger]\npoll_interval_secs = 9\nheartbeat_interval_secs = 40\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("user.toml"),
            "[trigger]\nheartbeat_interval_secs = 15\n",
        )
        .unwrap();

        let config = loader_in(dir.path()).load(&create_test_cli()).unwrap();
        assert_eq!(config.trigger.poll_interval(), Duration::from_secs(9));
        assert_eq!(config.trigger.heartbeat_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_cli_config_file_wins() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("user.toml"),
            "[forwarding]\nbind_address = \"127.0.0.1\"\n",
        )
        .unwrap();
        let extra = dir.path().join("extra.toml");
        fs::write(&extra, "[forwarding]\nbind_address = \"0.0.0.0\"\n").unwrap();

        let mut cli = create_test_cli();
        cli.config = Some(extra);

        let config = loader_in(dir.path()).load(&cli).unwrap();
        assert_eq!(
            config.forwarding.bind_address().unwrap().to_string(),
            "0.0.0.0"
        );
    }

    #[test]
    fn test_missing_cli_config_is_error() {
        let dir = tempdir().unwrap();
        let mut cli = create_test_cli();
        cli.config = Some(dir.path().join("nope.toml"));

        let result = loader_in(dir.path()).load(&cli);
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_cli_mode_overrides_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("user.toml"), "[trigger]\nmode = \"events\"\n").unwrap();

        let mut cli = create_test_cli();
        cli.mode = Some(TriggerMode::Polling);

        let config = loader_in(dir.path()).load(&cli).unwrap();
        assert_eq!(config.trigger.mode(), TriggerMode::Polling);
        assert_eq!(config.trigger.heartbeat_for_mode(), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("system.toml"), "[trigger\nmode = ").unwrap();

        let result = loader_in(dir.path()).load(&create_test_cli());
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_invalid_value_returns_error() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("user.toml"),
            "[runtime]\nrequest_timeout_secs = 0\n",
        )
        .unwrap();

        let result = loader_in(dir.path()).load(&create_test_cli());
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
