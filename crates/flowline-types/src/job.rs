//! Queue job payloads and identity keys.
//!
//! Two logical queues exist: the workflow queue carries run-level
//! transitions (execute, continue) and the step queue carries one tool
//! invocation each. Job ids double as idempotency keys: enqueueing a key
//! that already exists is a no-op.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::{Backoff, RetryPolicy};

/// Logical queue names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    #[serde(rename = "workflow:execute")]
    Workflow,
    #[serde(rename = "step:execute")]
    Step,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Workflow => "workflow:execute",
            QueueName::Step => "step:execute",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow:execute" => Ok(QueueName::Workflow),
            "step:execute" => Ok(QueueName::Step),
            other => Err(format!("invalid queue name: '{other}'")),
        }
    }
}

/// Run-level job on the workflow queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowJob {
    /// Start a run: mark it RUNNING and schedule its first step.
    Execute { run_id: Uuid, workflow_id: Uuid },
    /// A step-run completed: schedule the next step or finish the run.
    Continue {
        run_id: Uuid,
        completed_step_run_id: Uuid,
    },
}

impl WorkflowJob {
    pub fn run_id(&self) -> Uuid {
        match self {
            WorkflowJob::Execute { run_id, .. } | WorkflowJob::Continue { run_id, .. } => *run_id,
        }
    }

    /// Identity key: the run id for execute jobs, `continue-{stepRunId}`
    /// for continuations.
    pub fn job_id(&self) -> String {
        match self {
            WorkflowJob::Execute { run_id, .. } => run_id.to_string(),
            WorkflowJob::Continue {
                completed_step_run_id,
                ..
            } => continue_job_id(completed_step_run_id),
        }
    }
}

pub fn continue_job_id(step_run_id: &Uuid) -> String {
    format!("continue-{step_run_id}")
}

/// One tool invocation on the step queue. Keyed by the step-run id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepJob {
    pub step_run_id: Uuid,
    pub step_id: Uuid,
    pub run_id: Uuid,
    /// Resolved input; informational, the step-run record is authoritative.
    #[serde(default)]
    pub input: Value,
}

impl StepJob {
    pub fn job_id(&self) -> String {
        self.step_run_id.to_string()
    }
}

/// Delivery options attached to a job at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl JobOptions {
    /// Workflow jobs are delivered once and never retried.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::default(),
        }
    }
}

impl Default for JobOptions {
    fn default() -> Self {
        RetryPolicy::default().into()
    }
}

impl From<RetryPolicy> for JobOptions {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts.max(1),
            backoff: policy.backoff,
        }
    }
}
