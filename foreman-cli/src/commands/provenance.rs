//! `foreman provenance` — inspect and verify the generation ledger.

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use colored::Colorize;

use foreman_core::types::TaskId;
use foreman_provenance::{Ledger, ProvenanceEntry};

#[derive(Subcommand, Debug)]
pub enum ProvenanceCommand {
    /// Show one entry by id.
    Show { id: String },

    /// Show all entries recorded for a task, oldest first.
    Task { task_id: String },

    /// Recompute every entry hash and resolve every parent.
    Verify,

    /// Totals by status and model.
    Stats,
}

pub fn run(command: ProvenanceCommand) -> Result<()> {
    let root = std::env::current_dir().context("could not determine working directory")?;
    let ledger = Ledger::new(&root);

    match command {
        ProvenanceCommand::Show { id } => match ledger.get(&id)? {
            Some(entry) => print_entry(&entry),
            None => bail!("no entry with id {id}"),
        },
        ProvenanceCommand::Task { task_id } => {
            let entries = ledger.for_task(&TaskId::from(task_id.as_str()))?;
            if entries.is_empty() {
                println!("no entries for task {task_id}");
                return Ok(());
            }
            for entry in entries {
                print_entry(&entry);
            }
        }
        ProvenanceCommand::Verify => {
            let breaks = ledger.verify()?;
            if breaks.is_empty() {
                println!("{} ledger intact", "ok:".green().bold());
                return Ok(());
            }
            for chain_break in &breaks {
                println!(
                    "{} {}: {}",
                    "break:".red().bold(),
                    chain_break.id,
                    chain_break.reason
                );
            }
            bail!("{} chain break(s) found", breaks.len());
        }
        ProvenanceCommand::Stats => {
            let stats = ledger.stats()?;
            println!("{} entries", stats.total);
            let mut statuses: Vec<_> = stats.by_status.iter().collect();
            statuses.sort();
            for (status, count) in statuses {
                println!("  {status}: {count}");
            }
            let mut models: Vec<_> = stats.by_model.iter().collect();
            models.sort();
            for (model, count) in models {
                println!("  model {model}: {count}");
            }
        }
    }
    Ok(())
}

fn print_entry(entry: &ProvenanceEntry) {
    println!(
        "{}  task {}  {}  {}  {}",
        &entry.id[..12.min(entry.id.len())].cyan(),
        entry.task_id,
        entry.model,
        entry.status,
        entry.created_at.format("%Y-%m-%d %H:%M:%S"),
    );
    for file in &entry.touched_files {
        println!("    {file}");
    }
}
