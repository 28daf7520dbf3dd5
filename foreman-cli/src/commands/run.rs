//! `foreman run` — drive the orchestrator against tasks.json.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use foreman_core::config;
use foreman_core::state::FileStateStore;
use foreman_engine::task_source::TaskSource;
use foreman_engine::{
    init_tracing, scheduler, CommandInvoker, CommandRunner, JsonTaskSource, Orchestrator,
    RunSummary,
};

use crate::MergePolicyArg;

/// Arguments for `foreman run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Maximum concurrently executing workspaces (overrides config).
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Stop after this many batches.
    #[arg(long)]
    pub max_batches: Option<u64>,

    /// Conflict handling during the merge phase (overrides config).
    #[arg(long)]
    pub merge_policy: Option<MergePolicyArg>,

    /// Command to run per task inside its workspace.
    #[arg(long, default_value = "foreman-generate")]
    pub generate_cmd: String,

    /// Command that must pass before a workspace may merge.
    #[arg(long, default_value = "foreman-verify")]
    pub verify_cmd: String,

    /// Model name recorded in provenance entries.
    #[arg(long, default_value = "external")]
    pub model: String,

    /// Show what the first batch would dispatch, without executing.
    #[arg(long)]
    pub dry_run: bool,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        init_tracing();
        let root = std::env::current_dir().context("could not determine working directory")?;
        if !root.join(".git").exists() {
            bail!("not a git repository: {}", root.display());
        }

        let mut config = config::load_at(&root).context("failed to load .foreman/config.json")?;
        if let Some(parallelism) = self.parallelism {
            config.parallelism = parallelism;
        }
        if let Some(policy) = self.merge_policy {
            config.merge_policy = policy.into();
        }

        let tasks = JsonTaskSource::in_root(&root);
        if self.dry_run {
            return dry_run(&tasks, config.parallelism);
        }

        let (generate_program, generate_args) = split_command(&self.generate_cmd)?;
        let (verify_program, verify_args) = split_command(&self.verify_cmd)?;

        let orchestrator = Orchestrator::new(
            root.clone(),
            config.clone(),
            Arc::new(FileStateStore::new(root)),
            Arc::new(tasks),
            Arc::new(CommandInvoker::new(
                generate_program,
                generate_args,
                config.generation_timeout(),
                self.model,
            )),
            Arc::new(CommandRunner::new(
                verify_program,
                verify_args,
                config.verification_timeout(),
            )),
        );

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        let summary = runtime.block_on(orchestrator.run(self.max_batches))?;
        print_summary(&summary);
        Ok(())
    }
}

fn dry_run(tasks: &JsonTaskSource, parallelism: usize) -> Result<()> {
    let pending = tasks.pending_tasks()?;
    let merged = tasks.merged_tasks()?;
    let ready = scheduler::ready_tasks(&pending, &merged, parallelism);
    if ready.is_empty() {
        println!("{}", "nothing to dispatch".yellow());
        return Ok(());
    }
    println!("would dispatch {} task(s):", ready.len());
    for task in ready {
        println!("  {} {}", task.id.to_string().cyan(), task.title);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    for batch in &summary.batches {
        println!(
            "batch {}: {} merged, {} failed, {} skipped",
            batch.batch,
            batch.merged.len().to_string().green(),
            batch.failed.len().to_string().red(),
            batch.skipped.len()
        );
    }
    println!(
        "{} {} merged, {} failed ({})",
        "done:".bold(),
        summary.merged_count().to_string().green(),
        summary.failed_count().to_string().red(),
        summary.halt
    );
}

/// Split a shell-less command string into program + args.
fn split_command(command: &str) -> Result<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts.next().context("empty command")?;
    Ok((program, parts.collect()))
}
