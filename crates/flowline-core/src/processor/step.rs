//! Step processor: one attempt of one step.
//!
//! Marks the step-run RUNNING, resolves the tool, builds the tool context,
//! invokes the tool, and records the outcome. Retrying is not done here;
//! the queue layer re-delivers the job with an incremented attempt count.
//! A step-run that already COMPLETED is never executed again: redelivery
//! only replays the hand-off to the workflow queue.

use std::sync::Arc;
use std::time::Duration;

use flowline_types::error::{EngineError, RepositoryError};
use flowline_types::job::StepJob;
use flowline_types::run::{RunStatus, StepRunPatch};
use flowline_types::tool::{ToolContext, ToolResult};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;
use crate::tool::ToolRegistry;

const RUN_CONTEXT_NOT_FOUND: &str = "Run context not found";

pub struct StepProcessor<R: WorkflowRepository> {
    repo: Arc<R>,
    tools: Arc<dyn ToolRegistry>,
}

impl<R: WorkflowRepository> StepProcessor<R> {
    pub fn new(repo: Arc<R>, tools: Arc<dyn ToolRegistry>) -> Self {
        Self { repo, tools }
    }

    /// Execute one attempt. `attempts_made` counts the attempts that already
    /// failed, so this attempt is number `attempts_made + 1`.
    ///
    /// Returns the tool output on success, or the stored output when the
    /// step-run already completed. A tool-reported failure is a
    /// retryable `StepExecution` error; missing records and missing tools are
    /// not retryable.
    pub async fn process_execute(
        &self,
        job: &StepJob,
        attempts_made: u32,
    ) -> Result<Value, EngineError> {
        let attempt = attempts_made + 1;
        tracing::info!(
            step_run_id = %job.step_run_id,
            step_id = %job.step_id,
            attempt,
            "executing step"
        );

        let current = self
            .repo
            .get_step_run(&job.step_run_id)
            .await?
            .ok_or_else(|| EngineError::step_fatal(job.step_id, RUN_CONTEXT_NOT_FOUND))?;
        if current.status == RunStatus::Completed {
            tracing::info!(
                step_run_id = %job.step_run_id,
                "step already completed, skipping tool"
            );
            return Ok(current.output.unwrap_or_else(|| Value::Object(Map::new())));
        }

        let started = StepRunPatch::status(RunStatus::Running)
            .with_attempts(attempt)
            .started_now();
        match self.repo.update_step_run(&job.step_run_id, &started).await {
            Ok(()) => {}
            Err(RepositoryError::NotFound) => {
                return Err(EngineError::step_fatal(job.step_id, RUN_CONTEXT_NOT_FOUND));
            }
            Err(e) => return Err(e.into()),
        }

        let step = self
            .repo
            .get_step(&job.step_id)
            .await?
            .ok_or_else(|| EngineError::step_fatal(job.step_id, "Step not found"))?;

        let tool = self.tools.get(&step.tool_name)?;

        let ctx = self.build_context(job).await?;

        let execution = tool.execute(&job.input, &ctx);
        let result = match step.timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), execution)
                .await
                .unwrap_or_else(|_| {
                    ToolResult::fail(format!("Tool '{}' timed out after {ms}ms", step.tool_name))
                }),
            None => execution.await,
        };

        if !result.success {
            let error = result.error.unwrap_or_else(|| "Unknown error".to_string());
            self.repo
                .update_step_run(&job.step_run_id, &StepRunPatch::error(error.clone()))
                .await?;
            tracing::warn!(
                step_run_id = %job.step_run_id,
                step_id = %job.step_id,
                attempt,
                error = %error,
                "step attempt failed"
            );
            return Err(EngineError::step_retryable(job.step_id, error));
        }

        let output = result.data.unwrap_or_else(|| Value::Object(Map::new()));
        self.repo
            .update_step_run(
                &job.step_run_id,
                &StepRunPatch::status(RunStatus::Completed)
                    .with_output(output.clone())
                    .completed_now(),
            )
            .await?;

        tracing::info!(step_run_id = %job.step_run_id, step_id = %job.step_id, "step completed");
        Ok(output)
    }

    async fn build_context(&self, job: &StepJob) -> Result<ToolContext, EngineError> {
        let fatal = || EngineError::step_fatal(job.step_id, RUN_CONTEXT_NOT_FOUND);

        let workflow_run = self.repo.get_run(&job.run_id).await?.ok_or_else(fatal)?;
        let step_run = self
            .repo
            .get_step_run(&job.step_run_id)
            .await?
            .ok_or_else(fatal)?;

        let previous_outputs = self
            .previous_outputs(&job.run_id, &workflow_run.workflow_id)
            .await?;
        let variables = workflow_run
            .input
            .clone()
            .filter(|v| !v.is_null())
            .unwrap_or_else(|| Value::Object(Map::new()));

        Ok(ToolContext {
            workflow_run,
            step_run,
            previous_outputs,
            variables,
        })
    }

    async fn previous_outputs(
        &self,
        run_id: &Uuid,
        workflow_id: &Uuid,
    ) -> Result<Map<String, Value>, EngineError> {
        let completed = self
            .repo
            .list_step_runs_by_status(run_id, RunStatus::Completed)
            .await?;
        let steps = self.repo.list_steps(workflow_id).await?;

        let mut outputs = Map::new();
        for sr in completed {
            let Some(output) = sr.output.filter(|o| !o.is_null()) else {
                continue;
            };
            if let Some(step) = steps.iter().find(|s| s.id == sr.step_id) {
                outputs.insert(step.name.clone(), output);
            }
        }
        Ok(outputs)
    }
}
