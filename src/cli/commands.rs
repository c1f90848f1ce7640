//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// kubeplan - Declarative managed Kubernetes provisioning.
#[derive(Parser, Debug)]
#[command(name = "kubeplan")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the manifest (defaults to the nearest `kubeplan.yaml`).
    #[arg(short, long, global = true, env = "KUBEPLAN_MANIFEST")]
    pub manifest: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Run against the in-memory simulated cloud and an in-memory state store.
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the manifest.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show what a reconciliation pass would change.
    Plan {
        /// Show changed fields per node.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Reconcile the cluster to match the manifest.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Compare recorded state with live resources.
    Drift,

    /// Delete every resource recorded in state.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Manage the state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show recorded resources.
    Show,

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Remove the lock regardless of owner.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_apply_with_global_flags() {
        let cli = Cli::try_parse_from([
            "kubeplan",
            "apply",
            "--yes",
            "--simulate",
            "--format",
            "json",
            "-m",
            "infra/kubeplan.yaml",
        ])
        .unwrap();

        assert!(cli.simulate);
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.manifest, Some(PathBuf::from("infra/kubeplan.yaml")));
        assert!(matches!(cli.command, Commands::Apply { yes: true }));
    }

    #[test]
    fn test_parse_state_unlock() {
        let cli = Cli::try_parse_from(["kubeplan", "state", "unlock", "--force"]).unwrap();
        match cli.command {
            Commands::State {
                command: StateCommands::Unlock { lock_id, force },
            } => {
                assert!(force);
                assert!(lock_id.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
