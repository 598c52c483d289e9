//! CLI run subcommands: trigger, list, show, cancel.

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color};
use console::style;
use serde_json::Value;
use uuid::Uuid;

use flowline_types::run::{RunStatus, StepRun, WorkflowRun};

use crate::cli::new_table;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum RunCommand {
    /// Start a run of an ACTIVE workflow.
    Trigger {
        workflow_id: Uuid,

        /// JSON input made available as `{{input.*}}`.
        #[arg(long)]
        input: Option<String>,
    },

    /// List recent runs of a workflow, newest first.
    #[command(alias = "ls")]
    List {
        workflow_id: Uuid,

        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// Show a run and its step runs.
    Show { run_id: Uuid },

    /// Cancel a PENDING or RUNNING run.
    Cancel { run_id: Uuid },
}

pub async fn handle_run_command(cmd: RunCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        RunCommand::Trigger { workflow_id, input } => {
            let input = parse_input(input.as_deref())?;
            let run = state.run_service.trigger_run(&workflow_id, input).await?;
            print_run_summary(&run, "Triggered", json)
        }
        RunCommand::List { workflow_id, limit } => {
            let runs = state.run_service.list_runs(&workflow_id, limit).await?;
            print_runs(&runs, json)
        }
        RunCommand::Show { run_id } => {
            let run = state.run_service.get_run(&run_id).await?;
            let step_runs = state.run_service.list_step_runs(&run_id).await?;
            print_run_detail(&run, &step_runs, json)
        }
        RunCommand::Cancel { run_id } => {
            let run = state.run_service.cancel_run(&run_id).await?;
            print_run_summary(&run, "Cancelled", json)
        }
    }
}

fn parse_input(raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(|s| serde_json::from_str(s).context("--input must be valid JSON"))
        .transpose()
}

fn print_run_summary(run: &WorkflowRun, verb: &str, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
    } else {
        println!(
            "  {} {verb} run {} ({})",
            style("*").green().bold(),
            style(run.id).cyan(),
            run.status
        );
    }
    Ok(())
}

fn print_runs(runs: &[WorkflowRun], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs.");
        println!();
        return Ok(());
    }

    let mut table = new_table();
    table.set_header(vec![
        Cell::new("Run").fg(Color::Cyan),
        Cell::new("Status"),
        Cell::new("Created"),
        Cell::new("Error"),
    ]);
    for run in runs {
        table.add_row(vec![
            Cell::new(run.id),
            status_cell(run.status),
            Cell::new(run.created_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(run.error.as_deref().unwrap_or("")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn print_run_detail(run: &WorkflowRun, step_runs: &[StepRun], json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({ "run": run, "steps": step_runs });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  Run {} ({})", style(run.id).cyan().bold(), run.status);
    println!("  Workflow: {}", run.workflow_id);
    if let Some(error) = &run.error {
        println!("  Error: {}", style(error).red());
    }
    if let Some(output) = &run.output {
        println!("  Output: {output}");
    }

    if !step_runs.is_empty() {
        let mut table = new_table();
        table.set_header(vec![
            Cell::new("Step run").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Error"),
        ]);
        for sr in step_runs {
            table.add_row(vec![
                Cell::new(sr.id),
                status_cell(sr.status),
                Cell::new(format!("{}/{}", sr.attempts_made, sr.max_attempts)),
                Cell::new(sr.error.as_deref().unwrap_or("")),
            ]);
        }
        println!();
        println!("{table}");
    }
    println!();
    Ok(())
}

fn status_cell(status: RunStatus) -> Cell {
    let cell = Cell::new(status);
    match status {
        RunStatus::Completed => cell.fg(Color::Green),
        RunStatus::Failed => cell.fg(Color::Red),
        RunStatus::Running => cell.fg(Color::Cyan),
        RunStatus::Cancelled => cell.fg(Color::DarkGrey),
        RunStatus::Pending | RunStatus::Paused => cell.fg(Color::Yellow),
    }
}
