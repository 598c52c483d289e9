//! CLI command definitions for the `flowline` binary.
//!
//! Uses clap derive macros. Management commands follow a noun-verb pattern
//! (`flowline workflow import`, `flowline run trigger`).

pub mod run;
pub mod tools;
pub mod worker;
pub mod workflow;

use clap::{Parser, Subcommand};
use comfy_table::{ContentArrangement, Table, presets};

/// Durable sequential workflow engine.
#[derive(Parser)]
#[command(name = "flowline", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed output (-v for debug, -vv for trace). Defaults to RUST_LOG.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the workflow and step worker pools until Ctrl+C or SIGTERM.
    Worker,

    /// Manage workflow definitions.
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Trigger, inspect, and cancel workflow runs.
    Run {
        #[command(subcommand)]
        action: run::RunCommand,
    },

    /// List the built-in tools a worker registers.
    Tools,
}

/// Tracing filter directive for a `-v` count; `None` defers to RUST_LOG.
pub fn verbosity_filter(verbose: u8) -> Option<&'static str> {
    match verbose {
        0 => None,
        1 => Some("info,flowline=debug"),
        _ => Some("trace"),
    }
}

/// A table in the style shared by every listing command.
pub(crate) fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}
