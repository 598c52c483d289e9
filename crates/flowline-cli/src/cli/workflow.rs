//! CLI workflow management subcommands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color};
use console::style;
use uuid::Uuid;

use flowline_core::service::WorkflowDetail;
use flowline_types::workflow::{WorkflowSpec, WorkflowStatus};

use crate::cli::new_table;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Create a workflow and its steps from a YAML or JSON definition.
    Import {
        /// Path to the definition file.
        file: PathBuf,
    },

    /// List workflows.
    #[command(alias = "ls")]
    List,

    /// Show a workflow with its steps.
    Show { id: Uuid },

    /// Allow runs to be triggered for a workflow.
    Activate { id: Uuid },

    /// Stop accepting new runs for a workflow.
    Archive { id: Uuid },
}

pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Import { file } => handle_import(&file, state, json).await,
        WorkflowCommand::List => handle_list(state, json).await,
        WorkflowCommand::Show { id } => {
            let detail = state.workflow_service.get_workflow_with_steps(&id).await?;
            print_detail(&detail, json)
        }
        WorkflowCommand::Activate { id } => {
            handle_set_status(&id, WorkflowStatus::Active, state, json).await
        }
        WorkflowCommand::Archive { id } => {
            handle_set_status(&id, WorkflowStatus::Archived, state, json).await
        }
    }
}

/// Parse a definition file. JSON documents parse as YAML too.
pub async fn load_definition(file: &Path) -> Result<WorkflowSpec> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    WorkflowSpec::from_yaml(&content)
        .with_context(|| format!("failed to parse workflow definition {}", file.display()))
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

async fn handle_import(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let spec = load_definition(file).await?;
    let detail = state.workflow_service.import_definition(spec).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Imported workflow '{}'",
        style("*").green().bold(),
        style(&detail.workflow.name).cyan()
    );
    println!("  ID: {}", detail.workflow.id);
    println!("  Status: {}", detail.workflow.status);
    println!("  Steps: {}", detail.steps.len());
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List / show
// ---------------------------------------------------------------------------

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let workflows = state.workflow_service.list_workflows().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&workflows)?);
        return Ok(());
    }

    if workflows.is_empty() {
        println!();
        println!("  No workflows registered.");
        println!(
            "  Import one with: {}",
            style("flowline workflow import <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = new_table();
    table.set_header(vec![
        Cell::new("ID"),
        Cell::new("Name").fg(Color::Cyan),
        Cell::new("Version"),
        Cell::new("Status"),
    ]);
    for wf in &workflows {
        table.add_row(vec![
            Cell::new(wf.id),
            Cell::new(&wf.name),
            Cell::new(wf.version),
            status_cell(wf.status),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn print_detail(detail: &WorkflowDetail, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(detail)?);
        return Ok(());
    }

    let wf = &detail.workflow;
    println!();
    println!("  {} (v{})", style(&wf.name).cyan().bold(), wf.version);
    println!("  ID: {}", wf.id);
    println!("  Status: {}", wf.status);
    if let Some(description) = &wf.description {
        println!("  {description}");
    }

    if detail.steps.is_empty() {
        println!("  No steps.");
        println!();
        return Ok(());
    }

    let mut table = new_table();
    table.set_header(vec![
        Cell::new("#"),
        Cell::new("Step").fg(Color::Cyan),
        Cell::new("Tool"),
        Cell::new("Attempts"),
    ]);
    for step in &detail.steps {
        let attempts = step
            .retry
            .as_ref()
            .map(|r| r.max_attempts.to_string())
            .unwrap_or_else(|| "default".to_string());
        table.add_row(vec![
            Cell::new(step.order),
            Cell::new(&step.name),
            Cell::new(&step.tool_name),
            Cell::new(attempts),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Status changes
// ---------------------------------------------------------------------------

async fn handle_set_status(
    id: &Uuid,
    status: WorkflowStatus,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let workflow = state.workflow_service.set_status(id, status).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&workflow)?);
    } else {
        println!(
            "  {} Workflow '{}' is now {}",
            style("*").green().bold(),
            style(&workflow.name).cyan(),
            workflow.status
        );
    }
    Ok(())
}

fn status_cell(status: WorkflowStatus) -> Cell {
    let cell = Cell::new(status);
    match status {
        WorkflowStatus::Active => cell.fg(Color::Green),
        WorkflowStatus::Draft => cell.fg(Color::Yellow),
        WorkflowStatus::Archived => cell.fg(Color::DarkGrey),
    }
}
