//! Command line interface built on clap.
//!
//! [`Cli`] carries the global flags (`--config`, `--workers`, `--verbose`)
//! and a [`Command`]: `run` drives job files to completion, `check` only
//! validates them.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run batch jobs through their lifecycle.
#[derive(Debug, Parser)]
#[command(name = "batchflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Engine config file (default: ./batchflow.toml if present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Worker pool size, overrides the config file.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Execute job files and wait until every job settles.
    Run {
        /// TOML job definitions.
        #[arg(required = true)]
        jobs: Vec<PathBuf>,

        /// Print final job snapshots as JSON instead of progress output.
        #[arg(long)]
        json: bool,
    },

    /// Validate job files against the configured modules.
    Check {
        #[arg(required = true)]
        jobs: Vec<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["batchflow", "run", "a.toml", "b.toml", "--json"]);
        match cli.command {
            Command::Run { jobs, json } => {
                assert_eq!(jobs, vec![PathBuf::from("a.toml"), PathBuf::from("b.toml")]);
                assert!(json);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "batchflow",
            "--config",
            "site.toml",
            "--workers",
            "16",
            "--verbose",
            "check",
            "sim.toml",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("site.toml")));
        assert_eq!(cli.workers, Some(16));
        assert!(matches!(cli.command, Command::Check { .. }));
    }

    #[test]
    fn run_needs_a_job_file() {
        assert!(Cli::try_parse_from(["batchflow", "run"]).is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
