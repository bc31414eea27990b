//! Command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};

/// Team coordinator for AI coding agents.
#[derive(Debug, Parser)]
#[command(name = "cohort", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit machine-readable JSON where supported.
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scaffold `.cohort/config.yaml` in the current directory.
    Init {
        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },

    /// Run a team against a feature request.
    Run {
        /// The feature request to decompose and build.
        request: String,

        /// Coordination-only lead: its provider calls cannot edit files.
        #[arg(long)]
        delegate: bool,

        /// Override the configured maximum concurrent agents.
        #[arg(long, env = "COHORT_MAX_AGENTS")]
        max_agents: Option<usize>,

        /// Require lead approval of each agent's plan before execution.
        #[arg(long)]
        plan_approval: bool,
    },

    /// Show task-store statistics for the configured team.
    Status,
}
