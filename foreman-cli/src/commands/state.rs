//! `foreman state` — manage the persisted engine state.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use foreman_core::state::{FileStateStore, StateStore};
use foreman_core::types::UnifiedState;

#[derive(Subcommand, Debug)]
pub enum StateCommand {
    /// Replace the persisted state with a fresh default. The prior state
    /// survives as the rolling backup.
    Reset,
}

pub fn run(command: StateCommand) -> Result<()> {
    let root = std::env::current_dir().context("could not determine working directory")?;
    match command {
        StateCommand::Reset => {
            let store = FileStateStore::new(&root);
            store.save(&UnifiedState::default())?;
            println!("{} state reset", "ok:".green().bold());
        }
    }
    Ok(())
}
