//! Foreman — parallel task orchestration over git worktrees.
//!
//! # Usage
//!
//! ```text
//! foreman run [--parallelism N] [--max-batches N] [--merge-policy stop-on-conflict|skip-and-continue]
//!             [--generate-cmd CMD] [--verify-cmd CMD] [--dry-run]
//! foreman status [--json]
//! foreman checkpoint list|create|restore <id|latest>|prune --keep N
//! foreman provenance show <id> | task <task-id> | verify | stats
//! foreman state reset
//! ```

mod commands;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    checkpoint::CheckpointCommand, provenance::ProvenanceCommand, run::RunArgs,
    state::StateCommand, status::StatusArgs,
};
use foreman_core::config::MergePolicy;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "foreman",
    version,
    about = "Run generation tasks in parallel git worktrees and merge the survivors",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive the orchestrator against tasks.json.
    Run(RunArgs),

    /// Show task, workspace, and breaker status.
    Status(StatusArgs),

    /// Create, list, restore, and prune git checkpoints.
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommand,
    },

    /// Inspect and verify the provenance ledger.
    Provenance {
        #[command(subcommand)]
        command: ProvenanceCommand,
    },

    /// Manage the persisted engine state.
    State {
        #[command(subcommand)]
        command: StateCommand,
    },
}

// ---------------------------------------------------------------------------
// Shared MergePolicy argument — parsed from CLI strings, converts to core type
// ---------------------------------------------------------------------------

/// Thin wrapper so clap can parse `MergePolicy` from CLI args.
#[derive(Debug, Clone, Default)]
pub struct MergePolicyArg(pub MergePolicy);

impl FromStr for MergePolicyArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stop-on-conflict" => Ok(Self(MergePolicy::StopOnConflict)),
            "skip-and-continue" => Ok(Self(MergePolicy::SkipAndContinue)),
            other => Err(format!(
                "unknown merge policy '{other}'; expected: stop-on-conflict, skip-and-continue"
            )),
        }
    }
}

impl fmt::Display for MergePolicyArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            MergePolicy::StopOnConflict => write!(f, "stop-on-conflict"),
            MergePolicy::SkipAndContinue => write!(f, "skip-and-continue"),
        }
    }
}

impl From<MergePolicyArg> for MergePolicy {
    fn from(p: MergePolicyArg) -> Self {
        p.0
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Checkpoint { command } => commands::checkpoint::run(command),
        Commands::Provenance { command } => commands::provenance::run(command),
        Commands::State { command } => commands::state::run(command),
    }
}
