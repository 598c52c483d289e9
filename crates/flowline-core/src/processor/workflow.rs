//! Workflow processor: run-level transitions.
//!
//! `process_execute` starts a run and schedules its first step;
//! `process_continue` reacts to a completed step-run by scheduling the next
//! step or completing the run. Scheduling a step persists a PENDING
//! step-run and enqueues a step job keyed by the step-run id.

use std::sync::Arc;

use flowline_types::error::EngineError;
use flowline_types::job::{JobOptions, StepJob, WorkflowJob};
use flowline_types::run::{RunPatch, RunStatus, StepRun};
use flowline_types::workflow::{RetryPolicy, Step};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::engine::orchestrator::Orchestrator;
use crate::queue::{JobQueue, WorkQueues};
use crate::repository::workflow::WorkflowRepository;

/// Statuses a run may still leave through the engine.
const LIVE: [RunStatus; 2] = [RunStatus::Pending, RunStatus::Running];

pub struct WorkflowProcessor<R: WorkflowRepository, O: Orchestrator, Q: JobQueue> {
    repo: Arc<R>,
    orchestrator: Arc<O>,
    queues: WorkQueues<Q>,
    /// Applied to steps without their own retry policy.
    default_retry: RetryPolicy,
}

impl<R, O, Q> WorkflowProcessor<R, O, Q>
where
    R: WorkflowRepository,
    O: Orchestrator,
    Q: JobQueue,
{
    pub fn new(
        repo: Arc<R>,
        orchestrator: Arc<O>,
        queues: WorkQueues<Q>,
        default_retry: RetryPolicy,
    ) -> Self {
        Self {
            repo,
            orchestrator,
            queues,
            default_retry,
        }
    }

    /// Dispatch a workflow job to its handler.
    pub async fn process(&self, job: &WorkflowJob) -> Result<(), EngineError> {
        match job {
            WorkflowJob::Execute {
                run_id,
                workflow_id,
            } => self.process_execute(run_id, workflow_id).await,
            WorkflowJob::Continue {
                run_id,
                completed_step_run_id,
            } => self.process_continue(run_id, completed_step_run_id).await,
        }
    }

    /// Start a run: mark it RUNNING, then schedule the first step or
    /// complete it right away when the workflow has no steps.
    pub async fn process_execute(
        &self,
        run_id: &Uuid,
        workflow_id: &Uuid,
    ) -> Result<(), EngineError> {
        tracing::info!(
            run_id = %run_id,
            workflow_id = %workflow_id,
            "starting workflow execution"
        );

        if self.repo.get_run(run_id).await?.is_none() {
            return Err(EngineError::not_found("WorkflowRun", run_id));
        }

        // A run cancelled while still queued never starts.
        let started = self
            .repo
            .transition_run(
                run_id,
                &LIVE,
                &RunPatch::status(RunStatus::Running).started_now(),
            )
            .await?;
        if !started {
            tracing::info!(run_id = %run_id, "run already finished, skipping execute");
            return Ok(());
        }

        let result = self.orchestrator.initialize(run_id).await?;
        if result.completed {
            let completed = self
                .repo
                .transition_run(
                    run_id,
                    &LIVE,
                    &RunPatch::status(RunStatus::Completed).completed_now(),
                )
                .await?;
            if completed {
                tracing::info!(run_id = %run_id, "workflow completed (no steps)");
            }
            return Ok(());
        }

        if let (Some(step), Some(input)) = (result.next_step, result.step_input) {
            self.schedule_step(run_id, &step, input).await?;
            tracing::info!(run_id = %run_id, step = %step.name, "enqueued first step");
        }
        Ok(())
    }

    /// Advance a run after `completed_step_run_id` finished.
    ///
    /// A missing or already finished run is left untouched, which makes
    /// duplicate and late continuations harmless.
    pub async fn process_continue(
        &self,
        run_id: &Uuid,
        completed_step_run_id: &Uuid,
    ) -> Result<(), EngineError> {
        tracing::info!(
            run_id = %run_id,
            completed_step_run_id = %completed_step_run_id,
            "continuing workflow"
        );

        let Some(run) = self.repo.get_run(run_id).await? else {
            tracing::info!(run_id = %run_id, "run not found, skipping continue");
            return Ok(());
        };
        if run.status.is_terminal() {
            tracing::info!(
                run_id = %run_id,
                status = %run.status,
                "run finished, skipping continue"
            );
            return Ok(());
        }

        let result = self
            .orchestrator
            .get_next_step(run_id, completed_step_run_id)
            .await?;

        if result.completed {
            let output = self
                .repo
                .latest_step_run(run_id)
                .await?
                .and_then(|sr| sr.output)
                .unwrap_or_else(|| Value::Object(Map::new()));
            let completed = self
                .repo
                .transition_run(
                    run_id,
                    &LIVE,
                    &RunPatch::status(RunStatus::Completed)
                        .with_output(output)
                        .completed_now(),
                )
                .await?;
            if completed {
                tracing::info!(run_id = %run_id, "workflow completed");
            } else {
                tracing::info!(run_id = %run_id, "run finished elsewhere, completion dropped");
            }
            return Ok(());
        }

        if let (Some(step), Some(input)) = (result.next_step, result.step_input) {
            self.schedule_step(run_id, &step, input).await?;
            tracing::info!(run_id = %run_id, step = %step.name, "enqueued next step");
        }
        Ok(())
    }

    /// Persist a PENDING step-run for `step` and enqueue its job.
    ///
    /// A step runs at most once per run, so a step-run left behind by an
    /// interrupted earlier delivery of the same job is reused rather than
    /// duplicated; the enqueue is a no-op if its job already exists.
    async fn schedule_step(
        &self,
        run_id: &Uuid,
        step: &Step,
        input: Value,
    ) -> Result<StepRun, EngineError> {
        let policy = step.retry.clone().unwrap_or_else(|| self.default_retry.clone());

        let existing = self
            .repo
            .list_step_runs(run_id)
            .await?
            .into_iter()
            .find(|sr| sr.step_id == step.id);

        let step_run = match existing {
            Some(sr) => {
                tracing::debug!(run_id = %run_id, step_run_id = %sr.id, "reusing step run");
                sr
            }
            None => {
                let sr = StepRun::pending(*run_id, step.id, input, policy.max_attempts.max(1));
                self.repo.create_step_run(&sr).await?;
                sr
            }
        };

        let job = StepJob {
            step_run_id: step_run.id,
            step_id: step.id,
            run_id: *run_id,
            input: step_run.input.clone().unwrap_or(Value::Null),
        };
        self.queues
            .add_step_job(&job, JobOptions::from(policy))
            .await?;
        Ok(step_run)
    }
}
