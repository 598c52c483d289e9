use std::sync::Arc;

use flowline_types::job::WorkflowJob;
use flowline_types::run::{RunPatch, RunStatus};

use crate::engine::orchestrator::Orchestrator;
use crate::processor::WorkflowProcessor;
use crate::queue::{JobQueue, QueuedJob, STALLED_ERROR};
use crate::repository::workflow::WorkflowRepository;
use crate::worker::pool::JobHandler;

/// Handles jobs on the workflow queue.
///
/// Workflow jobs get a single attempt. When processing fails the job is
/// failed and a run that is still live is marked FAILED so it does not hang.
pub struct WorkflowWorker<R: WorkflowRepository, O: Orchestrator, Q: JobQueue> {
    repo: Arc<R>,
    queue: Arc<Q>,
    processor: WorkflowProcessor<R, O, Q>,
}

impl<R: WorkflowRepository, O: Orchestrator, Q: JobQueue> WorkflowWorker<R, O, Q> {
    pub fn new(repo: Arc<R>, queue: Arc<Q>, processor: WorkflowProcessor<R, O, Q>) -> Self {
        Self {
            repo,
            queue,
            processor,
        }
    }

    /// Mark the job's run FAILED unless it already settled.
    async fn fail_run(&self, job: &WorkflowJob, message: &str) {
        let run_id = job.run_id();
        let patch = RunPatch::status(RunStatus::Failed)
            .with_error(message)
            .completed_now();
        match self
            .repo
            .transition_run(&run_id, &[RunStatus::Pending, RunStatus::Running], &patch)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::debug!(run_id = %run_id, "run already settled, not failing it"),
            Err(e) => tracing::error!(run_id = %run_id, error = %e, "failed to mark run as failed"),
        }
    }
}

impl<R, O, Q> JobHandler for WorkflowWorker<R, O, Q>
where
    R: WorkflowRepository + 'static,
    O: Orchestrator + 'static,
    Q: JobQueue + 'static,
{
    async fn handle(&self, job: QueuedJob) {
        let workflow_job = match job.decode::<WorkflowJob>() {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "undecodable workflow job");
                if let Err(e) = self.queue.fail(&job, &e.to_string()).await {
                    tracing::error!(job_id = %job.id, error = %e, "failed to fail job");
                }
                return;
            }
        };

        match self.processor.process(&workflow_job).await {
            Ok(()) => {
                if let Err(e) = self.queue.complete(&job).await {
                    tracing::error!(job_id = %job.id, error = %e, "failed to complete job");
                }
            }
            Err(e) => {
                tracing::error!(
                    job_id = %job.id,
                    run_id = %workflow_job.run_id(),
                    error = %e,
                    "workflow job failed"
                );
                if let Err(qe) = self.queue.fail(&job, &e.to_string()).await {
                    tracing::error!(job_id = %job.id, error = %qe, "failed to fail job");
                }
                self.fail_run(&workflow_job, &e.to_string()).await;
            }
        }
    }

    async fn on_stalled_out(&self, job: QueuedJob) {
        match job.decode::<WorkflowJob>() {
            Ok(workflow_job) => self.fail_run(&workflow_job, STALLED_ERROR).await,
            Err(e) => tracing::error!(job_id = %job.id, error = %e, "undecodable stalled workflow job"),
        }
    }
}
