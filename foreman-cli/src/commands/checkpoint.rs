//! `foreman checkpoint` — create, list, restore, prune.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use foreman_core::config;
use foreman_core::state::{FileStateStore, StateStore};
use foreman_core::types::TaskId;
use foreman_vcs::{CheckpointManager, RestoreTarget};

#[derive(Subcommand, Debug)]
pub enum CheckpointCommand {
    /// List checkpoints, newest first.
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Create a checkpoint of the current working tree.
    Create {
        /// Checkpoint message.
        #[arg(long)]
        message: Option<String>,

        /// Associate the checkpoint with a task.
        #[arg(long)]
        task: Option<String>,
    },

    /// Hard-reset the working tree to a checkpoint.
    Restore {
        /// Checkpoint id, or `latest`.
        id: String,
    },

    /// Delete all but the newest checkpoints.
    Prune {
        /// How many to keep; defaults to the configured retention.
        #[arg(long)]
        keep: Option<usize>,
    },
}

pub fn run(command: CheckpointCommand) -> Result<()> {
    let root = std::env::current_dir().context("could not determine working directory")?;
    let manager = CheckpointManager::new(&root);

    match command {
        CheckpointCommand::List { limit } => {
            let checkpoints = manager.list(limit)?;
            if checkpoints.is_empty() {
                println!("no checkpoints");
                return Ok(());
            }
            for checkpoint in checkpoints {
                println!(
                    "{}  {}  {}  {}",
                    checkpoint.id.cyan(),
                    &checkpoint.commit_sha[..12.min(checkpoint.commit_sha.len())],
                    checkpoint.created_at.format("%Y-%m-%d %H:%M:%S"),
                    checkpoint.message
                );
            }
        }
        CheckpointCommand::Create { message, task } => {
            let task_id = task.map(TaskId::from);
            let checkpoint = manager.create(message.as_deref(), task_id.as_ref())?;
            println!(
                "created {} at {} ({} file(s) committed)",
                checkpoint.id.green(),
                &checkpoint.commit_sha[..12.min(checkpoint.commit_sha.len())],
                checkpoint.files_changed
            );
        }
        CheckpointCommand::Restore { id } => {
            let target = if id == "latest" {
                RestoreTarget::Latest
            } else {
                RestoreTarget::Id(id)
            };
            let checkpoint = manager.restore(target)?;
            FileStateStore::new(&root).update(&mut |s| s.metrics.total_rollbacks += 1)?;
            println!(
                "restored {} ({})",
                checkpoint.id.green(),
                checkpoint.message
            );
        }
        CheckpointCommand::Prune { keep } => {
            let keep = match keep {
                Some(keep) => keep,
                None => config::load_at(&root)?.checkpoint_retention,
            };
            let removed = manager.prune(keep)?;
            println!("pruned {removed} checkpoint(s), kept {keep}");
        }
    }
    Ok(())
}
