//! Command-line interface definitions for portsync.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::Parser;
use std::path::PathBuf;

use crate::reconcile::TriggerMode;

/// Keep host port forwards in sync with running containers.
///
/// portsync watches the container runtime and forwards every published TCP
/// and UDP port of every running container from the host to the container's
/// address, adding and removing forwards as containers come and go.
#[derive(Parser, Debug)]
#[command(name = "portsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for CLI flags). It must exist.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// How passes are triggered (overrides `trigger.mode`).
    #[arg(short = 'm', long = "mode", value_enum, value_name = "MODE")]
    pub mode: Option<TriggerMode>,

    /// Run a single reconciliation pass, release every forward and exit.
    #[arg(long = "once")]
    pub once: bool,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}
