//! `flowline worker`: run both worker pools in the foreground.

use anyhow::Result;
use console::style;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

pub async fn run_worker(state: &AppState) -> Result<()> {
    let engine = state.engine()?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        crate::shutdown_signal().await;
        tracing::info!("shutdown signal received");
        trigger.cancel();
    });

    println!(
        "  {} Flowline worker running (workflow x{}, step x{})",
        style("⚡").bold(),
        state.config.workflow_concurrency,
        state.config.step_concurrency
    );
    println!("  Data: {}", style(state.data_dir.display()).dim());
    println!("  {}", style("Press Ctrl+C to stop").dim());

    engine.run(shutdown).await;

    println!("\n  Worker stopped.");
    Ok(())
}
