//! Run lifecycle operations: trigger, cancel, inspect.

use std::sync::Arc;

use flowline_types::error::EngineError;
use flowline_types::job::WorkflowJob;
use flowline_types::run::{RunPatch, RunStatus, StepRun, WorkflowRun};
use flowline_types::workflow::WorkflowStatus;
use serde_json::Value;
use uuid::Uuid;

use crate::queue::{JobQueue, WorkQueues};
use crate::repository::workflow::WorkflowRepository;

pub struct RunService<R: WorkflowRepository, Q: JobQueue> {
    repo: Arc<R>,
    queues: WorkQueues<Q>,
}

impl<R: WorkflowRepository, Q: JobQueue> RunService<R, Q> {
    pub fn new(repo: Arc<R>, queues: WorkQueues<Q>) -> Self {
        Self { repo, queues }
    }

    /// Create a PENDING run of an ACTIVE workflow and enqueue its execute job.
    pub async fn trigger_run(
        &self,
        workflow_id: &Uuid,
        input: Option<Value>,
    ) -> Result<WorkflowRun, EngineError> {
        let workflow = self
            .repo
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Workflow", workflow_id))?;
        if workflow.status != WorkflowStatus::Active {
            return Err(EngineError::Validation(
                "Workflow must be ACTIVE to trigger a run".to_string(),
            ));
        }

        let run = WorkflowRun::pending(workflow.id, input);
        self.repo.create_run(&run).await?;
        self.queues
            .add_workflow_job(&WorkflowJob::Execute {
                run_id: run.id,
                workflow_id: workflow.id,
            })
            .await?;

        tracing::info!(run_id = %run.id, workflow_id = %workflow.id, "run triggered");
        Ok(run)
    }

    /// Cancel a PENDING or RUNNING run. Queued work for it becomes a no-op.
    pub async fn cancel_run(&self, run_id: &Uuid) -> Result<WorkflowRun, EngineError> {
        self.get_run(run_id).await?;

        let cancelled = self
            .repo
            .transition_run(
                run_id,
                &[RunStatus::Pending, RunStatus::Running],
                &RunPatch::status(RunStatus::Cancelled).completed_now(),
            )
            .await?;
        if !cancelled {
            return Err(EngineError::InvalidState(
                "Can only cancel PENDING or RUNNING runs".to_string(),
            ));
        }
        tracing::info!(run_id = %run_id, "run cancelled");
        self.get_run(run_id).await
    }

    pub async fn get_run(&self, run_id: &Uuid) -> Result<WorkflowRun, EngineError> {
        self.repo
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found("WorkflowRun", run_id))
    }

    /// Most recent runs of a workflow, newest first.
    pub async fn list_runs(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, EngineError> {
        Ok(self.repo.list_runs(workflow_id, limit).await?)
    }

    /// Step-runs of a run in creation order.
    pub async fn list_step_runs(&self, run_id: &Uuid) -> Result<Vec<StepRun>, EngineError> {
        self.get_run(run_id).await?;
        Ok(self.repo.list_step_runs(run_id).await?)
    }
}
