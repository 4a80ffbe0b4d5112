//! Command line of the scheduler daemon.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::DEFAULT_CONFIG_PATH;

/// Scheduling core of the Opal compute platform.
#[derive(Debug, Parser)]
#[command(name = "opal-scheduler", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the TOML configuration file.
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the dispatch, job health and node health loops until interrupted.
    Run,

    /// Run a single tick of one loop and print its summary as JSON.
    Tick {
        #[arg(value_enum)]
        target: LoopArg,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LoopArg {
    /// Dispatch, error recovery and terminal cleanup.
    Dispatch,
    /// Timeout invalidation and archival.
    JobHealth,
    /// Node expiry and exclusion.
    NodeHealth,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_with_defaults() {
        let cli = Cli::parse_from(["opal-scheduler", "run"]);
        assert!(matches!(cli.command, Command::Run));
        assert_eq!(cli.config, PathBuf::from("opal-scheduler.toml"));
        assert!(!cli.verbose);
    }

    #[test]
    fn cli_parses_tick_target() {
        let cli = Cli::parse_from(["opal-scheduler", "tick", "node-health"]);
        match cli.command {
            Command::Tick { target } => assert_eq!(target, LoopArg::NodeHealth),
            _ => panic!("expected Tick command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "opal-scheduler",
            "tick",
            "dispatch",
            "--config",
            "/etc/opal/scheduler.toml",
            "--verbose",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.config, PathBuf::from("/etc/opal/scheduler.toml"));
    }

    #[test]
    fn cli_rejects_unknown_loop() {
        assert!(Cli::try_parse_from(["opal-scheduler", "tick", "archive"]).is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
