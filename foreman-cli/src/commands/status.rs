//! `foreman status` — tasks, workspaces, breakers, and run metrics.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use foreman_core::state::{FileStateStore, StateStore};
use foreman_core::types::UnifiedState;
use foreman_engine::task_source::TaskSource;
use foreman_engine::JsonTaskSource;

/// Arguments for `foreman status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let root = std::env::current_dir().context("could not determine working directory")?;
        let state = FileStateStore::new(&root).load()?;
        let tasks = JsonTaskSource::in_root(&root);
        let pending = tasks.pending_tasks()?.len();
        let merged = tasks.merged_tasks()?.len();

        if self.json {
            let report = JsonReport {
                pending,
                merged,
                state: &state,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        print_tables(&state, pending, merged);
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    pending: usize,
    merged: usize,
    state: &'a UnifiedState,
}

#[derive(Tabled)]
struct AgentRow {
    task: String,
    branch: String,
    status: String,
    checkpoints: usize,
}

#[derive(Tabled)]
struct BreakerRow {
    name: String,
    state: String,
    failures: u32,
}

fn print_tables(state: &UnifiedState, pending: usize, merged: usize) {
    println!(
        "{} batch {}, {} pending, {} merged, success rate {:.0}%",
        "run:".bold(),
        state.loop_state.current_batch,
        pending,
        merged,
        state.metrics.success_rate() * 100.0
    );

    if !state.agents.is_empty() {
        let mut rows: Vec<AgentRow> = state
            .agents
            .values()
            .map(|agent| AgentRow {
                task: agent.task_id.to_string(),
                branch: agent.branch.clone(),
                status: format!("{:?}", agent.status).to_lowercase(),
                checkpoints: agent.checkpoints.len(),
            })
            .collect();
        rows.sort_by(|a, b| a.task.cmp(&b.task));
        let mut table = Table::new(rows);
        table.with(Style::sharp());
        println!("{table}");
    }

    if !state.breakers.is_empty() {
        let mut rows: Vec<BreakerRow> = state
            .breakers
            .iter()
            .map(|(name, record)| BreakerRow {
                name: name.clone(),
                state: record.state.to_string(),
                failures: record.failures,
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        let mut table = Table::new(rows);
        table.with(Style::sharp());
        println!("{table}");
    }

    let failed_label = if state.metrics.failed_tasks > 0 {
        state.metrics.failed_tasks.to_string().red().to_string()
    } else {
        state.metrics.failed_tasks.to_string()
    };
    println!(
        "{} {} merges, {} checkpoints, {} rollbacks, {} failed",
        "totals:".bold(),
        state.metrics.total_merges,
        state.metrics.total_checkpoints,
        state.metrics.total_rollbacks,
        failed_label
    );
}
