//! Wires processors and worker pools into one runnable engine.

use std::sync::Arc;
use std::time::Duration;

use flowline_types::config::EngineConfig;
use flowline_types::error::QueueError;
use flowline_types::job::QueueName;
use tokio_util::sync::CancellationToken;

use crate::engine::orchestrator::{Orchestrator, SequentialOrchestrator};
use crate::engine::resolver::TemplateResolver;
use crate::processor::{StepProcessor, WorkflowProcessor};
use crate::queue::{JobQueue, WorkQueues};
use crate::repository::workflow::WorkflowRepository;
use crate::tool::ToolRegistry;
use crate::worker::pool::{PoolConfig, WorkerPool};
use crate::worker::step::StepWorker;
use crate::worker::workflow::WorkflowWorker;

pub type DefaultOrchestrator<R> = SequentialOrchestrator<R, TemplateResolver>;

/// Both worker pools over a shared repository, queue, and tool registry.
pub struct Engine<R, Q, O = DefaultOrchestrator<R>>
where
    R: WorkflowRepository + 'static,
    Q: JobQueue + 'static,
    O: Orchestrator + 'static,
{
    workflow_pool: WorkerPool<Q, WorkflowWorker<R, O, Q>>,
    step_pool: WorkerPool<Q, StepWorker<R, Q>>,
}

impl<R, Q> Engine<R, Q>
where
    R: WorkflowRepository + 'static,
    Q: JobQueue + 'static,
{
    pub fn new(
        repo: Arc<R>,
        queue: Arc<Q>,
        tools: Arc<dyn ToolRegistry>,
        config: &EngineConfig,
    ) -> Self {
        let orchestrator = SequentialOrchestrator::new(Arc::clone(&repo), TemplateResolver);
        Self::with_orchestrator(repo, queue, tools, orchestrator, config)
    }
}

impl<R, Q, O> Engine<R, Q, O>
where
    R: WorkflowRepository + 'static,
    Q: JobQueue + 'static,
    O: Orchestrator + 'static,
{
    pub fn with_orchestrator(
        repo: Arc<R>,
        queue: Arc<Q>,
        tools: Arc<dyn ToolRegistry>,
        orchestrator: O,
        config: &EngineConfig,
    ) -> Self {
        let queues = WorkQueues::new(Arc::clone(&queue));
        let poll_interval = Duration::from_millis(config.poll_interval_ms);
        let stall_timeout = Duration::from_secs(config.stall_timeout_secs);

        let workflow_processor = WorkflowProcessor::new(
            Arc::clone(&repo),
            Arc::new(orchestrator),
            queues.clone(),
            config.default_retry.clone(),
        );
        let workflow_pool = WorkerPool::new(
            Arc::clone(&queue),
            WorkflowWorker::new(Arc::clone(&repo), Arc::clone(&queue), workflow_processor),
            PoolConfig {
                queue: QueueName::Workflow,
                concurrency: config.workflow_concurrency,
                poll_interval,
                stall_timeout,
                max_stalls: config.max_stalled_count,
            },
        );

        let step_processor = StepProcessor::new(Arc::clone(&repo), tools);
        let step_pool = WorkerPool::new(
            queue,
            StepWorker::new(repo, queues, step_processor),
            PoolConfig {
                queue: QueueName::Step,
                concurrency: config.step_concurrency,
                poll_interval,
                stall_timeout,
                max_stalls: config.max_stalled_count,
            },
        );

        Self {
            workflow_pool,
            step_pool,
        }
    }

    /// Run both pools until `shutdown` fires and in-flight jobs drain.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!("engine starting");
        tokio::join!(
            self.workflow_pool.run(shutdown.clone()),
            self.step_pool.run(shutdown)
        );
        tracing::info!("engine stopped");
    }

    /// Handle due jobs on both queues until neither has any left.
    /// Jobs waiting out a retry delay are not due and stay queued.
    pub async fn drain(&self) -> Result<usize, QueueError> {
        let mut total = 0;
        loop {
            let handled = self.workflow_pool.process_available().await?
                + self.step_pool.process_available().await?;
            if handled == 0 {
                return Ok(total);
            }
            total += handled;
        }
    }
}
