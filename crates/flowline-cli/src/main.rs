//! Flowline worker and management CLI.
//!
//! Binary name: `flowline`
//!
//! Resolves the data directory, loads `config.toml`, initializes tracing,
//! opens the database, then dispatches to the command handler.

mod cli;
mod state;

use anyhow::anyhow;
use clap::Parser;

use cli::{Cli, Commands};
use flowline_infra::config::load_engine_config;
use flowline_infra::data_dir::resolve_data_dir;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = resolve_data_dir();
    let config = load_engine_config(&data_dir).await;

    flowline_observe::tracing_setup::init_tracing(
        cli::verbosity_filter(cli.verbose),
        config.enable_otel,
    )
    .map_err(|e| anyhow!("failed to initialize tracing: {e}"))?;

    let state = AppState::init(data_dir, config).await?;

    let result = match cli.command {
        Commands::Worker => cli::worker::run_worker(&state).await,
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, cli.json).await
        }
        Commands::Run { action } => cli::run::handle_run_command(action, &state, cli.json).await,
        Commands::Tools => cli::tools::list_tools(&state, cli.json),
    };

    flowline_observe::tracing_setup::shutdown_tracing();
    result
}

/// Wait for Ctrl+C or SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
