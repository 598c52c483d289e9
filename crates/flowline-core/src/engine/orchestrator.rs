//! Sequential orchestrator: decides which step runs next.
//!
//! Steps run strictly by ascending `order`. After a step-run completes, the
//! next step is the definition with the smallest order greater than the
//! completed step's order. Its input mapping is resolved against the run
//! input, the outputs of every completed step (keyed by step name), and the
//! environment.

use std::collections::BTreeMap;
use std::sync::Arc;

use flowline_types::error::EngineError;
use flowline_types::run::{RunStatus, StepRun, WorkflowRun};
use flowline_types::workflow::Step;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

use super::resolver::{ResolverContext, VariableResolver};

// ---------------------------------------------------------------------------
// OrchestratorResult
// ---------------------------------------------------------------------------

/// Outcome of an orchestration decision.
#[derive(Debug, Clone)]
pub struct OrchestratorResult {
    /// No further steps remain.
    pub completed: bool,
    pub next_step: Option<Step>,
    /// Resolved input for `next_step`.
    pub step_input: Option<Value>,
}

impl OrchestratorResult {
    pub fn completed() -> Self {
        Self {
            completed: true,
            next_step: None,
            step_input: None,
        }
    }

    pub fn next(step: Step, input: Value) -> Self {
        Self {
            completed: false,
            next_step: Some(step),
            step_input: Some(input),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator trait
// ---------------------------------------------------------------------------

/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
pub trait Orchestrator: Send + Sync {
    /// Select the first step of a run.
    fn initialize(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<OrchestratorResult, EngineError>> + Send;

    /// Select the step after `completed_step_run_id`.
    fn get_next_step(
        &self,
        run_id: &Uuid,
        completed_step_run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<OrchestratorResult, EngineError>> + Send;
}

// ---------------------------------------------------------------------------
// SequentialOrchestrator
// ---------------------------------------------------------------------------

/// Ordered, one-step-at-a-time orchestrator.
///
/// Generic over the repository and the resolver so tests can swap either.
pub struct SequentialOrchestrator<R: WorkflowRepository, V: VariableResolver> {
    repo: Arc<R>,
    resolver: V,
    /// Fixed environment; `None` snapshots the process environment per call.
    env: Option<BTreeMap<String, String>>,
}

impl<R: WorkflowRepository, V: VariableResolver> SequentialOrchestrator<R, V> {
    pub fn new(repo: Arc<R>, resolver: V) -> Self {
        Self {
            repo,
            resolver,
            env: None,
        }
    }

    /// Resolve `env.*` against a fixed map instead of the process environment.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    async fn load_run(&self, run_id: &Uuid) -> Result<WorkflowRun, EngineError> {
        self.repo
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found("WorkflowRun", run_id))
    }

    fn context(&self, run: &WorkflowRun, steps: Map<String, Value>) -> ResolverContext {
        let input = run
            .input
            .clone()
            .filter(|v| !v.is_null())
            .unwrap_or_else(|| Value::Object(Map::new()));
        match &self.env {
            Some(env) => ResolverContext::new(input, steps, env.clone()),
            None => ResolverContext::with_process_env(input, steps),
        }
    }
}

/// Map each COMPLETED step-run's step name to its output. Step-runs without
/// an output, or whose definition is gone, contribute nothing.
fn completed_outputs(step_runs: &[StepRun], steps: &[Step]) -> Map<String, Value> {
    let mut outputs = Map::new();
    for sr in step_runs {
        if sr.status != RunStatus::Completed {
            continue;
        }
        let Some(output) = sr.output.as_ref().filter(|o| !o.is_null()) else {
            continue;
        };
        if let Some(step) = steps.iter().find(|s| s.id == sr.step_id) {
            outputs.insert(step.name.clone(), output.clone());
        }
    }
    outputs
}

impl<R: WorkflowRepository, V: VariableResolver> Orchestrator for SequentialOrchestrator<R, V> {
    async fn initialize(&self, run_id: &Uuid) -> Result<OrchestratorResult, EngineError> {
        let run = self.load_run(run_id).await?;
        let steps = self.repo.list_steps(&run.workflow_id).await?;

        let Some(first) = steps.into_iter().next() else {
            tracing::debug!(run_id = %run_id, "workflow has no steps");
            return Ok(OrchestratorResult::completed());
        };

        let ctx = self.context(&run, Map::new());
        let input = self.resolver.resolve(&first.input_mapping, &ctx);
        tracing::debug!(run_id = %run_id, step = %first.name, "selected first step");
        Ok(OrchestratorResult::next(first, input))
    }

    async fn get_next_step(
        &self,
        run_id: &Uuid,
        completed_step_run_id: &Uuid,
    ) -> Result<OrchestratorResult, EngineError> {
        let run = self.load_run(run_id).await?;
        let steps = self.repo.list_steps(&run.workflow_id).await?;
        let step_runs = self.repo.list_step_runs(run_id).await?;

        let completed = step_runs
            .iter()
            .find(|sr| sr.id == *completed_step_run_id)
            .ok_or_else(|| EngineError::not_found("StepRun", completed_step_run_id))?;

        let completed_step = steps
            .iter()
            .find(|s| s.id == completed.step_id)
            .ok_or_else(|| EngineError::not_found("Step", completed.step_id))?;

        if completed.status == RunStatus::Failed {
            return Err(EngineError::WorkflowExecution {
                run_id: run_id.to_string(),
                message: format!(
                    "Step '{}' failed: {}",
                    completed_step.name,
                    completed.error.as_deref().unwrap_or("unknown error")
                ),
            });
        }

        // `steps` is sorted by order, so the first greater order is the minimum.
        let Some(next) = steps.iter().find(|s| s.order > completed_step.order) else {
            tracing::debug!(run_id = %run_id, "no steps after '{}'", completed_step.name);
            return Ok(OrchestratorResult::completed());
        };

        let ctx = self.context(&run, completed_outputs(&step_runs, &steps));
        let input = self.resolver.resolve(&next.input_mapping, &ctx);
        tracing::debug!(
            run_id = %run_id,
            after = %completed_step.name,
            step = %next.name,
            "selected next step"
        );
        Ok(OrchestratorResult::next(next.clone(), input))
    }
}
