//! Application state wiring services together.
//!
//! Services are generic over repository and queue traits; `AppState` pins
//! them to the SQLite implementations from `flowline-infra`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use flowline_core::queue::WorkQueues;
use flowline_core::service::{RunService, WorkflowService};
use flowline_core::tool::{InMemoryToolRegistry, ToolRegistry};
use flowline_core::worker::Engine;
use flowline_infra::sqlite::pool::DatabasePool;
use flowline_infra::sqlite::queue::SqliteJobQueue;
use flowline_infra::sqlite::workflow::SqliteWorkflowRepository;
use flowline_infra::tools::{ToolRegistrationConfig, register_default_tools};
use flowline_types::config::EngineConfig;

pub type ConcreteWorkflowService = WorkflowService<SqliteWorkflowRepository>;
pub type ConcreteRunService = RunService<SqliteWorkflowRepository, SqliteJobQueue>;
pub type ConcreteEngine = Engine<SqliteWorkflowRepository, SqliteJobQueue>;

/// Shared state for every CLI command.
pub struct AppState {
    pub workflow_service: ConcreteWorkflowService,
    pub run_service: ConcreteRunService,
    pub repo: Arc<SqliteWorkflowRepository>,
    pub queue: Arc<SqliteJobQueue>,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Open the database under `data_dir` and wire the services.
    pub async fn init(data_dir: PathBuf, config: EngineConfig) -> anyhow::Result<Self> {
        let pool = DatabasePool::open(&data_dir)
            .await
            .with_context(|| format!("failed to open database in {}", data_dir.display()))?;

        let repo = Arc::new(SqliteWorkflowRepository::new(pool.clone()));
        let queue = Arc::new(SqliteJobQueue::new(pool));

        Ok(Self {
            workflow_service: WorkflowService::new(Arc::clone(&repo)),
            run_service: RunService::new(Arc::clone(&repo), WorkQueues::new(Arc::clone(&queue))),
            repo,
            queue,
            config,
            data_dir,
        })
    }

    /// Registry holding every enabled built-in tool.
    pub fn tool_registry(&self) -> anyhow::Result<Arc<InMemoryToolRegistry>> {
        let registry = Arc::new(InMemoryToolRegistry::new());
        register_default_tools(registry.as_ref(), &ToolRegistrationConfig::default())?;
        Ok(registry)
    }

    /// Both worker pools over this state's repository and queue.
    pub fn engine(&self) -> anyhow::Result<ConcreteEngine> {
        let tools: Arc<dyn ToolRegistry> = self.tool_registry()?;
        Ok(Engine::new(
            Arc::clone(&self.repo),
            Arc::clone(&self.queue),
            tools,
            &self.config,
        ))
    }
}
