//! In-memory test doubles for the repository, queue, and tool ports.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use flowline_types::error::{QueueError, RepositoryError};
use flowline_types::job::{JobOptions, QueueName};
use flowline_types::run::{RunPatch, RunStatus, StepRun, StepRunPatch, WorkflowRun};
use flowline_types::tool::{ToolContext, ToolMetadata, ToolResult};
use flowline_types::workflow::{RetryPolicy, Step, Workflow, WorkflowStatus};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::queue::{JobQueue, JobState, QueuedJob, STALLED_ERROR, StallSweep};
use crate::repository::workflow::WorkflowRepository;
use crate::tool::Tool;

// ---------------------------------------------------------------------------
// InMemoryRepository
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RepoState {
    workflows: Vec<Workflow>,
    steps: Vec<Step>,
    runs: Vec<WorkflowRun>,
    step_runs: Vec<StepRun>,
}

/// Vec-backed repository; insertion order is creation order.
#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<RepoState>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_run_patch(run: &mut WorkflowRun, patch: &RunPatch) {
    if let Some(status) = patch.status {
        run.status = status;
    }
    if let Some(output) = &patch.output {
        run.output = Some(output.clone());
    }
    if let Some(error) = &patch.error {
        run.error = Some(error.clone());
    }
    if let Some(at) = patch.started_at {
        run.started_at = Some(at);
    }
    if let Some(at) = patch.completed_at {
        run.completed_at = Some(at);
    }
}

fn apply_step_run_patch(sr: &mut StepRun, patch: &StepRunPatch) {
    if let Some(status) = patch.status {
        sr.status = status;
    }
    if let Some(output) = &patch.output {
        sr.output = Some(output.clone());
    }
    if let Some(error) = &patch.error {
        sr.error = Some(error.clone());
    }
    if let Some(n) = patch.attempts_made {
        sr.attempts_made = n;
    }
    if let Some(at) = patch.started_at {
        sr.started_at = Some(at);
    }
    if let Some(at) = patch.completed_at {
        sr.completed_at = Some(at);
    }
}

impl WorkflowRepository for InMemoryRepository {
    async fn create_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        self.state.lock().unwrap().workflows.push(workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state.workflows.iter().find(|w| w.id == *id).cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state.workflows.iter().rev().cloned().collect())
    }

    async fn update_workflow_status(
        &self,
        id: &Uuid,
        status: WorkflowStatus,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let wf = state
            .workflows
            .iter_mut()
            .find(|w| w.id == *id)
            .ok_or(RepositoryError::NotFound)?;
        wf.status = status;
        wf.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_workflow_version(&self, id: &Uuid) -> Result<u32, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let wf = state
            .workflows
            .iter_mut()
            .find(|w| w.id == *id)
            .ok_or(RepositoryError::NotFound)?;
        wf.version += 1;
        wf.updated_at = Utc::now();
        Ok(wf.version)
    }

    async fn create_step(&self, step: &Step) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        if state.steps.iter().any(|s| {
            s.workflow_id == step.workflow_id && (s.name == step.name || s.order == step.order)
        }) {
            return Err(RepositoryError::Conflict(format!(
                "step '{}' (order {}) already exists",
                step.name, step.order
            )));
        }
        state.steps.push(step.clone());
        Ok(())
    }

    async fn get_step(&self, id: &Uuid) -> Result<Option<Step>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state.steps.iter().find(|s| s.id == *id).cloned())
    }

    async fn list_steps(&self, workflow_id: &Uuid) -> Result<Vec<Step>, RepositoryError> {
        let state = self.state.lock().unwrap();
        let mut steps: Vec<Step> = state
            .steps
            .iter()
            .filter(|s| s.workflow_id == *workflow_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.order);
        Ok(steps)
    }

    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        self.state.lock().unwrap().runs.push(run.clone());
        Ok(())
    }

    async fn get_run(&self, id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state.runs.iter().find(|r| r.id == *id).cloned())
    }

    async fn update_run(&self, id: &Uuid, patch: &RunPatch) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id == *id)
            .ok_or(RepositoryError::NotFound)?;
        apply_run_patch(run, patch);
        Ok(())
    }

    async fn transition_run(
        &self,
        id: &Uuid,
        from: &[RunStatus],
        patch: &RunPatch,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        match state
            .runs
            .iter_mut()
            .find(|r| r.id == *id && from.contains(&r.status))
        {
            Some(run) => {
                apply_run_patch(run, patch);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_runs(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .runs
            .iter()
            .rev()
            .filter(|r| r.workflow_id == *workflow_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn create_step_run(&self, step_run: &StepRun) -> Result<(), RepositoryError> {
        self.state.lock().unwrap().step_runs.push(step_run.clone());
        Ok(())
    }

    async fn get_step_run(&self, id: &Uuid) -> Result<Option<StepRun>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state.step_runs.iter().find(|s| s.id == *id).cloned())
    }

    async fn update_step_run(
        &self,
        id: &Uuid,
        patch: &StepRunPatch,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let sr = state
            .step_runs
            .iter_mut()
            .find(|s| s.id == *id)
            .ok_or(RepositoryError::NotFound)?;
        apply_step_run_patch(sr, patch);
        Ok(())
    }

    async fn list_step_runs(&self, run_id: &Uuid) -> Result<Vec<StepRun>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .step_runs
            .iter()
            .filter(|s| s.workflow_run_id == *run_id)
            .cloned()
            .collect())
    }

    async fn list_step_runs_by_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
    ) -> Result<Vec<StepRun>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .step_runs
            .iter()
            .filter(|s| s.workflow_run_id == *run_id && s.status == status)
            .cloned()
            .collect())
    }

    async fn latest_step_run(&self, run_id: &Uuid) -> Result<Option<StepRun>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .step_runs
            .iter()
            .rev()
            .find(|s| s.workflow_run_id == *run_id)
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// InMemoryQueue
// ---------------------------------------------------------------------------

struct JobRecord {
    job: QueuedJob,
    run_at: chrono::DateTime<Utc>,
}

/// Vec-backed queue; insertion order is enqueue order.
#[derive(Default)]
pub struct InMemoryQueue {
    jobs: Mutex<Vec<JobRecord>>,
    /// Enqueues onto this queue fail with a backend error.
    unavailable: Mutex<Option<QueueName>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make enqueues onto `queue` fail until called again with `None`.
    pub fn set_unavailable(&self, queue: Option<QueueName>) {
        *self.unavailable.lock().unwrap() = queue;
    }

    /// Snapshot of every job on `queue`, in enqueue order.
    pub fn jobs(&self, queue: QueueName) -> Vec<QueuedJob> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.job.queue == queue)
            .map(|r| r.job.clone())
            .collect()
    }

    /// Make every waiting job due now.
    pub fn expire_delays(&self) {
        let now = Utc::now();
        for record in self.jobs.lock().unwrap().iter_mut() {
            record.run_at = now;
        }
    }

    /// Run `f` on the record behind `job` if that reservation is still live.
    fn with_reservation<T>(
        &self,
        job: &QueuedJob,
        f: impl FnOnce(&mut JobRecord) -> T,
    ) -> Result<T, QueueError> {
        let mut jobs = self.jobs.lock().unwrap();
        let record = jobs
            .iter_mut()
            .find(|r| r.job.id == job.id)
            .ok_or_else(|| QueueError::JobNotFound(job.id.clone()))?;
        let same_reservation = record.job.state == JobState::Active
            && record.job.reserved_at == job.reserved_at
            && record.job.attempts_made == job.attempts_made
            && record.job.stalled_count == job.stalled_count;
        if !same_reservation {
            return Err(QueueError::ReservationLost(job.id.clone()));
        }
        Ok(f(record))
    }
}

impl JobQueue for InMemoryQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        job_id: &str,
        payload: &Value,
        options: &JobOptions,
    ) -> Result<bool, QueueError> {
        if *self.unavailable.lock().unwrap() == Some(queue) {
            return Err(QueueError::Backend(format!("{queue} queue unavailable")));
        }
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.iter().any(|r| r.job.id == job_id) {
            return Ok(false);
        }
        jobs.push(JobRecord {
            job: QueuedJob {
                id: job_id.to_string(),
                queue,
                payload: payload.clone(),
                attempts_made: 0,
                options: *options,
                state: JobState::Waiting,
                last_error: None,
                reserved_at: None,
                stalled_count: 0,
            },
            run_at: Utc::now(),
        });
        Ok(true)
    }

    async fn reserve(&self, queue: QueueName) -> Result<Option<QueuedJob>, QueueError> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();
        let Some(record) = jobs.iter_mut().find(|r| {
            r.job.queue == queue && r.job.state == JobState::Waiting && r.run_at <= now
        }) else {
            return Ok(None);
        };
        record.job.state = JobState::Active;
        record.job.reserved_at = Some(now);
        Ok(Some(record.job.clone()))
    }

    async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError> {
        self.with_reservation(job, |r| r.job.state = JobState::Completed)
    }

    async fn retry(&self, job: &QueuedJob, delay: Duration, error: &str) -> Result<(), QueueError> {
        self.with_reservation(job, |r| {
            r.job.attempts_made += 1;
            r.job.state = JobState::Waiting;
            r.job.last_error = Some(error.to_string());
            r.job.reserved_at = None;
            r.run_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(3650));
        })
    }

    async fn fail(&self, job: &QueuedJob, error: &str) -> Result<(), QueueError> {
        self.with_reservation(job, |r| {
            r.job.attempts_made += 1;
            r.job.state = JobState::Failed;
            r.job.last_error = Some(error.to_string());
        })
    }

    async fn requeue_stalled(
        &self,
        queue: QueueName,
        older_than: Duration,
        max_stalls: u32,
    ) -> Result<StallSweep, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let mut sweep = StallSweep::default();
        for record in self.jobs.lock().unwrap().iter_mut() {
            let stalled = record.job.queue == queue
                && record.job.state == JobState::Active
                && record.job.reserved_at.is_some_and(|at| at <= cutoff);
            if !stalled {
                continue;
            }
            if record.job.stalled_count >= max_stalls {
                record.job.state = JobState::Failed;
                record.job.last_error = Some(STALLED_ERROR.to_string());
                sweep.failed.push(record.job.clone());
            } else {
                record.job.state = JobState::Waiting;
                record.job.reserved_at = None;
                record.job.stalled_count += 1;
                sweep.requeued += 1;
            }
        }
        Ok(sweep)
    }

    async fn get(&self, job_id: &str) -> Result<Option<QueuedJob>, QueueError> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs.iter().find(|r| r.job.id == job_id).map(|r| r.job.clone()))
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

fn metadata(name: &str) -> ToolMetadata {
    ToolMetadata {
        name: name.to_string(),
        version: "1.0.0".to_string(),
        description: format!("test tool {name}"),
    }
}

/// Returns its input unchanged.
pub struct EchoTool {
    metadata: ToolMetadata,
}

impl EchoTool {
    pub fn named(name: &str) -> Self {
        Self {
            metadata: metadata(name),
        }
    }
}

impl Tool for EchoTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn execute(&self, input: &Value, _ctx: &ToolContext) -> ToolResult {
        ToolResult::ok(input.clone())
    }
}

/// Fails a fixed number of times, then echoes its input.
pub struct FlakyTool {
    metadata: ToolMetadata,
    remaining_failures: AtomicU32,
    message: Option<String>,
    pub calls: Arc<AtomicU32>,
}

impl FlakyTool {
    pub fn new(name: &str, failures: u32, message: Option<&str>) -> Self {
        Self {
            metadata: metadata(name),
            remaining_failures: AtomicU32::new(failures),
            message: message.map(str::to_string),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Never succeeds.
    pub fn always(name: &str, message: &str) -> Self {
        Self::new(name, u32::MAX, Some(message))
    }
}

impl Tool for FlakyTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn execute(&self, input: &Value, _ctx: &ToolContext) -> ToolResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            ToolResult {
                success: false,
                data: None,
                error: self.message.clone(),
            }
        } else {
            ToolResult::ok(input.clone())
        }
    }
}

/// Reports what it was handed in its context.
pub struct ContextEchoTool {
    metadata: ToolMetadata,
}

impl ContextEchoTool {
    pub fn named(name: &str) -> Self {
        Self {
            metadata: metadata(name),
        }
    }
}

impl Tool for ContextEchoTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn execute(&self, input: &Value, ctx: &ToolContext) -> ToolResult {
        ToolResult::ok(json!({
            "input": input,
            "previous": ctx.previous_outputs,
            "variables": ctx.variables,
            "attempt": ctx.step_run.attempts_made,
            "run_status": ctx.workflow_run.status,
        }))
    }
}

/// Sleeps before answering.
pub struct SlowTool {
    metadata: ToolMetadata,
    delay: Duration,
}

impl SlowTool {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            metadata: metadata(name),
            delay,
        }
    }
}

impl Tool for SlowTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn execute(&self, input: &Value, _ctx: &ToolContext) -> ToolResult {
        tokio::time::sleep(self.delay).await;
        ToolResult::ok(input.clone())
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

/// An ACTIVE workflow in a fresh in-memory repository.
pub struct Fixture {
    pub repo: Arc<InMemoryRepository>,
    pub workflow: Workflow,
}

impl Fixture {
    pub async fn new() -> Self {
        let repo = Arc::new(InMemoryRepository::new());
        let now = Utc::now();
        let workflow = Workflow {
            id: Uuid::now_v7(),
            name: "test-workflow".to_string(),
            description: None,
            version: 1,
            status: WorkflowStatus::Active,
            created_at: now,
            updated_at: now,
        };
        repo.create_workflow(&workflow).await.unwrap();
        Self { repo, workflow }
    }

    /// Step executed by the `echo` tool.
    pub async fn step(&self, name: &str, order: i32, input_mapping: Value) -> Step {
        self.step_with(name, order, "echo", input_mapping, None).await
    }

    pub async fn step_with(
        &self,
        name: &str,
        order: i32,
        tool_name: &str,
        input_mapping: Value,
        retry: Option<RetryPolicy>,
    ) -> Step {
        let step = Step {
            id: Uuid::now_v7(),
            workflow_id: self.workflow.id,
            name: name.to_string(),
            description: None,
            tool_name: tool_name.to_string(),
            config: json!({}),
            input_mapping,
            retry,
            timeout_ms: None,
            order,
            created_at: Utc::now(),
        };
        self.repo.create_step(&step).await.unwrap();
        step
    }

    pub async fn run(&self, input: Value) -> WorkflowRun {
        let run = WorkflowRun::pending(self.workflow.id, Some(input));
        self.repo.create_run(&run).await.unwrap();
        run
    }

    pub async fn step_run(&self, run: &WorkflowRun, step: &Step) -> StepRun {
        let sr = StepRun::pending(run.id, step.id, json!({}), 3);
        self.repo.create_step_run(&sr).await.unwrap();
        sr
    }
}
