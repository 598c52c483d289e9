//! Durable work queue port.
//!
//! The engine talks to its queue only through [`JobQueue`]. Jobs are keyed
//! by caller-chosen ids that double as idempotency keys, carry a JSON
//! payload, and move through `waiting -> active -> completed | failed`, with
//! `retry` returning an active job to `waiting` after a delay.
//!
//! Settling a job (`complete`, `retry`, `fail`) is tied to the reservation
//! that delivered it: once a job has been requeued as stalled, the worker
//! that lost it can no longer settle it.

pub mod retry;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flowline_types::error::QueueError;
use flowline_types::job::{JobOptions, QueueName, StepJob, WorkflowJob};
use serde::Serialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// QueuedJob
// ---------------------------------------------------------------------------

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("invalid job state: '{other}'")),
        }
    }
}

/// A job as seen by a worker after reservation.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: String,
    pub queue: QueueName,
    pub payload: Value,
    /// Attempts that already failed before this delivery.
    pub attempts_made: u32,
    pub options: JobOptions,
    pub state: JobState,
    pub last_error: Option<String>,
    pub reserved_at: Option<DateTime<Utc>>,
    /// Times this job was found stalled and put back.
    pub stalled_count: u32,
}

impl QueuedJob {
    /// Decode the payload into a typed job.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, QueueError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| QueueError::Serialization(e.to_string()))
    }
}

/// Outcome of one stall sweep.
#[derive(Debug, Default)]
pub struct StallSweep {
    /// Stalled jobs returned to waiting.
    pub requeued: u64,
    /// Stalled jobs that used up their stall allowance and were failed.
    pub failed: Vec<QueuedJob>,
}

/// Error recorded on a job failed by the stall sweep.
pub const STALLED_ERROR: &str = "job stalled more than allowable limit";

// ---------------------------------------------------------------------------
// JobQueue trait
// ---------------------------------------------------------------------------

/// Queue backend used by the processors and worker pools.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait JobQueue: Send + Sync {
    /// Add a job. Returns `false` (and changes nothing) when a job with the
    /// same id already exists.
    fn enqueue(
        &self,
        queue: QueueName,
        job_id: &str,
        payload: &Value,
        options: &JobOptions,
    ) -> impl std::future::Future<Output = Result<bool, QueueError>> + Send;

    /// Atomically claim the oldest due waiting job on `queue`.
    fn reserve(
        &self,
        queue: QueueName,
    ) -> impl std::future::Future<Output = Result<Option<QueuedJob>, QueueError>> + Send;

    /// Settle `job` as done. Fails with `ReservationLost` unless `job` is
    /// still the live reservation.
    fn complete(
        &self,
        job: &QueuedJob,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;

    /// Record a failed attempt and make the job due again after `delay`.
    fn retry(
        &self,
        job: &QueuedJob,
        delay: Duration,
        error: &str,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;

    /// Record a failed attempt and park the job as failed for good.
    fn fail(
        &self,
        job: &QueuedJob,
        error: &str,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;

    /// Sweep active jobs reserved longer than `older_than`.
    ///
    /// A stalled job goes back to waiting while it has been stalled fewer
    /// than `max_stalls` times; after that it is failed with
    /// [`STALLED_ERROR`] and returned in [`StallSweep::failed`].
    fn requeue_stalled(
        &self,
        queue: QueueName,
        older_than: Duration,
        max_stalls: u32,
    ) -> impl std::future::Future<Output = Result<StallSweep, QueueError>> + Send;

    fn get(
        &self,
        job_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<QueuedJob>, QueueError>> + Send;
}

// ---------------------------------------------------------------------------
// WorkQueues
// ---------------------------------------------------------------------------

/// Typed producer over a [`JobQueue`] that applies the job key rules.
pub struct WorkQueues<Q: JobQueue> {
    queue: Arc<Q>,
}

impl<Q: JobQueue> Clone for WorkQueues<Q> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<Q: JobQueue> WorkQueues<Q> {
    pub fn new(queue: Arc<Q>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    /// Enqueue a run-level job. Workflow jobs get a single attempt.
    pub async fn add_workflow_job(&self, job: &WorkflowJob) -> Result<bool, QueueError> {
        let job_id = job.job_id();
        let added = self
            .queue
            .enqueue(
                QueueName::Workflow,
                &job_id,
                &to_payload(job)?,
                &JobOptions::single_attempt(),
            )
            .await?;
        if !added {
            tracing::debug!(job_id = %job_id, "workflow job already queued");
        }
        Ok(added)
    }

    /// Enqueue a step job keyed by its step-run id.
    pub async fn add_step_job(&self, job: &StepJob, options: JobOptions) -> Result<bool, QueueError> {
        let job_id = job.job_id();
        let added = self
            .queue
            .enqueue(QueueName::Step, &job_id, &to_payload(job)?, &options)
            .await?;
        if !added {
            tracing::debug!(job_id = %job_id, "step job already queued");
        }
        Ok(added)
    }
}

fn to_payload<T: Serialize>(job: &T) -> Result<Value, QueueError> {
    serde_json::to_value(job).map_err(|e| QueueError::Serialization(e.to_string()))
}
