use std::sync::Arc;

use flowline_types::error::EngineError;
use flowline_types::job::{StepJob, WorkflowJob};
use flowline_types::run::{RunPatch, RunStatus, StepRunPatch};

use crate::processor::StepProcessor;
use crate::queue::retry::RetryHandler;
use crate::queue::{JobQueue, QueuedJob, STALLED_ERROR, WorkQueues};
use crate::repository::workflow::WorkflowRepository;
use crate::worker::pool::JobHandler;

/// Handles jobs on the step queue.
///
/// A successful attempt enqueues the run's continuation and only then
/// completes the job, so a lost hand-off is redelivered instead of
/// stranding the run. A failed attempt is retried with backoff while it is
/// retryable and budget remains; otherwise the job, its step-run, and the
/// run are failed.
pub struct StepWorker<R: WorkflowRepository, Q: JobQueue> {
    repo: Arc<R>,
    queues: WorkQueues<Q>,
    processor: StepProcessor<R>,
}

impl<R: WorkflowRepository, Q: JobQueue> StepWorker<R, Q> {
    pub fn new(repo: Arc<R>, queues: WorkQueues<Q>, processor: StepProcessor<R>) -> Self {
        Self {
            repo,
            queues,
            processor,
        }
    }

    async fn enqueue_continuation(&self, step_job: &StepJob) -> Result<(), EngineError> {
        let cont = WorkflowJob::Continue {
            run_id: step_job.run_id,
            completed_step_run_id: step_job.step_run_id,
        };
        self.queues.add_workflow_job(&cont).await?;
        Ok(())
    }

    async fn on_success(&self, job: &QueuedJob, step_job: &StepJob) {
        if let Err(e) = self.enqueue_continuation(step_job).await {
            // The step-run stays COMPLETED; the redelivery skips the tool.
            let delay = RetryHandler::delay(&job.options.backoff, job.attempts_made + 1);
            tracing::error!(
                run_id = %step_job.run_id,
                step_run_id = %step_job.step_run_id,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "failed to enqueue continuation, redelivering step job"
            );
            if let Err(qe) = self.queues.queue().retry(job, delay, &e.to_string()).await {
                tracing::error!(
                    job_id = %job.id,
                    error = %qe,
                    "failed to reschedule step job, leaving it to stall recovery"
                );
            }
            return;
        }

        if let Err(e) = self.queues.queue().complete(job).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to complete step job");
        }
    }

    async fn on_failure(&self, job: &QueuedJob, step_job: &StepJob, err: EngineError) {
        let failed_attempts = job.attempts_made + 1;
        let message = err.message();

        if err.is_retryable() && RetryHandler::should_retry(&job.options, failed_attempts) {
            let delay = RetryHandler::delay(&job.options.backoff, failed_attempts);
            tracing::warn!(
                step_run_id = %step_job.step_run_id,
                attempt = failed_attempts,
                max_attempts = job.options.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "step attempt failed, retrying"
            );
            if let Err(e) = self.queues.queue().retry(job, delay, &message).await {
                tracing::error!(job_id = %job.id, error = %e, "failed to schedule retry");
            }
            return;
        }

        tracing::error!(
            run_id = %step_job.run_id,
            step_run_id = %step_job.step_run_id,
            attempts = failed_attempts,
            retryable = err.is_retryable(),
            error = %message,
            "step failed permanently"
        );
        if let Err(e) = self.queues.queue().fail(job, &message).await {
            tracing::error!(job_id = %job.id, error = %e, "failed to fail step job");
        }
        self.fail_step_and_run(step_job, failed_attempts, &message).await;
    }

    /// Mark the step-run FAILED and, while it is still live, the run.
    async fn fail_step_and_run(&self, step_job: &StepJob, attempts: u32, message: &str) {
        let step_patch = StepRunPatch::status(RunStatus::Failed)
            .with_error(message)
            .completed_now();
        if let Err(e) = self.repo.update_step_run(&step_job.step_run_id, &step_patch).await {
            tracing::error!(
                step_run_id = %step_job.step_run_id,
                error = %e,
                "failed to mark step-run failed"
            );
        }

        // A run that already settled (e.g. cancelled) keeps its status.
        let run_patch = RunPatch::status(RunStatus::Failed)
            .with_error(format!(
                "Step '{}' failed after {} attempts: {}",
                step_job.step_id, attempts, message
            ))
            .completed_now();
        if let Err(e) = self
            .repo
            .transition_run(
                &step_job.run_id,
                &[RunStatus::Pending, RunStatus::Running],
                &run_patch,
            )
            .await
        {
            tracing::error!(run_id = %step_job.run_id, error = %e, "failed to mark run failed");
        }
    }
}

impl<R, Q> JobHandler for StepWorker<R, Q>
where
    R: WorkflowRepository + 'static,
    Q: JobQueue + 'static,
{
    async fn handle(&self, job: QueuedJob) {
        let step_job = match job.decode::<StepJob>() {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "undecodable step job");
                if let Err(e) = self.queues.queue().fail(&job, &e.to_string()).await {
                    tracing::error!(job_id = %job.id, error = %e, "failed to fail job");
                }
                return;
            }
        };

        match self.processor.process_execute(&step_job, job.attempts_made).await {
            Ok(_) => self.on_success(&job, &step_job).await,
            Err(e) => self.on_failure(&job, &step_job, e).await,
        }
    }

    async fn on_stalled_out(&self, job: QueuedJob) {
        let Ok(step_job) = job.decode::<StepJob>() else {
            tracing::error!(job_id = %job.id, "undecodable stalled step job");
            return;
        };

        // Finished work whose hand-off was lost still moves the run on.
        match self.repo.get_step_run(&step_job.step_run_id).await {
            Ok(Some(sr)) if sr.status == RunStatus::Completed => {
                if let Err(e) = self.enqueue_continuation(&step_job).await {
                    tracing::error!(
                        run_id = %step_job.run_id,
                        step_run_id = %step_job.step_run_id,
                        error = %e,
                        "failed to enqueue continuation for stalled step job"
                    );
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(step_run_id = %step_job.step_run_id, error = %e, "failed to load step-run");
            }
        }

        self.fail_step_and_run(&step_job, job.attempts_made + 1, STALLED_ERROR)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobState;
    use crate::testing::{EchoTool, Fixture, FlakyTool, InMemoryQueue, InMemoryRepository};
    use crate::tool::{BoxTool, InMemoryToolRegistry, ToolRegistry};
    use flowline_types::job::{JobOptions, QueueName, continue_job_id};
    use flowline_types::run::StepRun;
    use flowline_types::workflow::{Backoff, BackoffKind, RetryPolicy, Step};
    use serde_json::json;

    struct Harness {
        fx: Fixture,
        queue: Arc<InMemoryQueue>,
        worker: StepWorker<InMemoryRepository, InMemoryQueue>,
    }

    async fn harness(tools: Vec<BoxTool>) -> Harness {
        let fx = Fixture::new().await;
        let queue = Arc::new(InMemoryQueue::new());
        let registry = InMemoryToolRegistry::new();
        for tool in tools {
            registry.register(tool).unwrap();
        }
        let processor = StepProcessor::new(Arc::clone(&fx.repo), Arc::new(registry));
        let worker = StepWorker::new(
            Arc::clone(&fx.repo),
            WorkQueues::new(Arc::clone(&queue)),
            processor,
        );
        Harness { fx, queue, worker }
    }

    impl Harness {
        async fn schedule(&self, step: &Step, max_attempts: u32) -> (StepRun, StepJob) {
            let run = self.fx.run(json!({})).await;
            self.fx
                .repo
                .update_run(&run.id, &RunPatch::status(RunStatus::Running).started_now())
                .await
                .unwrap();
            let sr = StepRun::pending(run.id, step.id, json!({"n": 1}), max_attempts);
            self.fx.repo.create_step_run(&sr).await.unwrap();
            let job = StepJob {
                step_run_id: sr.id,
                step_id: step.id,
                run_id: run.id,
                input: json!({"n": 1}),
            };
            let options = JobOptions {
                max_attempts,
                backoff: Backoff {
                    kind: BackoffKind::Fixed,
                    delay_ms: 60_000,
                },
            };
            WorkQueues::new(Arc::clone(&self.queue))
                .add_step_job(&job, options)
                .await
                .unwrap();
            (sr, job)
        }

        async fn deliver(&self) {
            let job = self.queue.reserve(QueueName::Step).await.unwrap().unwrap();
            self.worker.handle(job).await;
        }
    }

    #[tokio::test]
    async fn success_completes_job_and_enqueues_continuation() {
        let h = harness(vec![BoxTool::new(EchoTool::named("echo"))]).await;
        let step = h.fx.step("a", 1, json!({})).await;
        let (sr, job) = h.schedule(&step, 3).await;

        h.deliver().await;

        let queued = h.queue.get(&sr.id.to_string()).await.unwrap().unwrap();
        assert_eq!(queued.state, JobState::Completed);

        let cont = h.queue.get(&continue_job_id(&sr.id)).await.unwrap().unwrap();
        assert_eq!(cont.queue, QueueName::Workflow);
        assert_eq!(
            cont.decode::<WorkflowJob>().unwrap(),
            WorkflowJob::Continue {
                run_id: job.run_id,
                completed_step_run_id: sr.id,
            }
        );

        let stored = h.fx.repo.get_step_run(&sr.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.output, Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn retryable_failure_is_retried_then_succeeds() {
        let h = harness(vec![BoxTool::new(FlakyTool::new("flaky", 1, Some("HTTP 503")))]).await;
        let step = h
            .fx
            .step_with("a", 1, "flaky", json!({}), Some(RetryPolicy::default()))
            .await;
        let (sr, job) = h.schedule(&step, 3).await;

        h.deliver().await;
        let queued = h.queue.get(&sr.id.to_string()).await.unwrap().unwrap();
        assert_eq!(queued.state, JobState::Waiting);
        assert_eq!(queued.attempts_made, 1);
        assert_eq!(queued.last_error.as_deref(), Some("HTTP 503"));
        // still inside its backoff window
        assert!(h.queue.reserve(QueueName::Step).await.unwrap().is_none());

        let run = h.fx.repo.get_run(&job.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);

        h.queue.expire_delays();
        h.deliver().await;

        let stored = h.fx.repo.get_step_run(&sr.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.attempts_made, 2);
        assert!(h.queue.get(&continue_job_id(&sr.id)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn exhausted_budget_fails_step_run_and_run() {
        let h = harness(vec![BoxTool::new(FlakyTool::always("broken", "HTTP 503"))]).await;
        let step = h.fx.step_with("a", 1, "broken", json!({}), None).await;
        let (sr, job) = h.schedule(&step, 2).await;

        h.deliver().await;
        h.queue.expire_delays();
        h.deliver().await;

        let queued = h.queue.get(&sr.id.to_string()).await.unwrap().unwrap();
        assert_eq!(queued.state, JobState::Failed);
        assert_eq!(queued.attempts_made, 2);

        let stored = h.fx.repo.get_step_run(&sr.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("HTTP 503"));
        assert!(stored.completed_at.is_some());

        let run = h.fx.repo.get_run(&job.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(
            run.error.as_deref(),
            Some(format!("Step '{}' failed after 2 attempts: HTTP 503", step.id).as_str())
        );
        assert!(run.completed_at.is_some());
        assert!(h.queue.jobs(QueueName::Workflow).is_empty());
    }

    #[tokio::test]
    async fn missing_tool_fails_without_retry() {
        let h = harness(vec![]).await;
        let step = h.fx.step_with("a", 1, "ghost", json!({}), None).await;
        let (sr, job) = h.schedule(&step, 3).await;

        h.deliver().await;

        let queued = h.queue.get(&sr.id.to_string()).await.unwrap().unwrap();
        assert_eq!(queued.state, JobState::Failed);
        assert_eq!(queued.attempts_made, 1);

        let run = h.fx.repo.get_run(&job.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("Tool 'ghost' not found in registry"));
    }

    #[tokio::test]
    async fn failure_on_cancelled_run_keeps_cancelled() {
        let h = harness(vec![BoxTool::new(FlakyTool::always("broken", "boom"))]).await;
        let step = h.fx.step_with("a", 1, "broken", json!({}), None).await;
        let (sr, job) = h.schedule(&step, 1).await;
        h.fx
            .repo
            .update_run(&job.run_id, &RunPatch::status(RunStatus::Cancelled).completed_now())
            .await
            .unwrap();

        h.deliver().await;

        let stored = h.fx.repo.get_step_run(&sr.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        let run = h.fx.repo.get_run(&job.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn lost_continuation_redelivers_without_rerunning_tool() {
        let tool = FlakyTool::new("counted", 0, None);
        let calls = Arc::clone(&tool.calls);
        let h = harness(vec![BoxTool::new(tool)]).await;
        let step = h.fx.step_with("a", 1, "counted", json!({}), None).await;
        let (sr, job) = h.schedule(&step, 1).await;

        h.queue.set_unavailable(Some(QueueName::Workflow));
        h.deliver().await;

        let queued = h.queue.get(&sr.id.to_string()).await.unwrap().unwrap();
        assert_eq!(queued.state, JobState::Waiting);
        assert!(h.queue.jobs(QueueName::Workflow).is_empty());
        let stored = h.fx.repo.get_step_run(&sr.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);

        h.queue.set_unavailable(None);
        h.queue.expire_delays();
        h.deliver().await;

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        let queued = h.queue.get(&sr.id.to_string()).await.unwrap().unwrap();
        assert_eq!(queued.state, JobState::Completed);
        let cont = h.queue.get(&continue_job_id(&sr.id)).await.unwrap().unwrap();
        assert_eq!(
            cont.decode::<WorkflowJob>().unwrap(),
            WorkflowJob::Continue {
                run_id: job.run_id,
                completed_step_run_id: sr.id,
            }
        );
        let run = h.fx.repo.get_run(&job.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn late_worker_cannot_settle_a_requeued_job() {
        let tool = FlakyTool::new("counted", 0, None);
        let calls = Arc::clone(&tool.calls);
        let h = harness(vec![BoxTool::new(tool)]).await;
        let step = h.fx.step_with("a", 1, "counted", json!({}), None).await;
        let (sr, _job) = h.schedule(&step, 3).await;

        // the first reservation outlives the stall timeout
        let stale = h.queue.reserve(QueueName::Step).await.unwrap().unwrap();
        let sweep = h
            .queue
            .requeue_stalled(QueueName::Step, std::time::Duration::ZERO, 1)
            .await
            .unwrap();
        assert_eq!(sweep.requeued, 1);

        h.worker.handle(stale).await;
        let queued = h.queue.get(&sr.id.to_string()).await.unwrap().unwrap();
        assert_eq!(queued.state, JobState::Waiting);

        h.deliver().await;
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        let queued = h.queue.get(&sr.id.to_string()).await.unwrap().unwrap();
        assert_eq!(queued.state, JobState::Completed);
        assert_eq!(h.queue.jobs(QueueName::Workflow).len(), 1);
    }

    #[tokio::test]
    async fn stalled_out_job_fails_step_run_and_run() {
        let h = harness(vec![BoxTool::new(EchoTool::named("echo"))]).await;
        let step = h.fx.step("a", 1, json!({})).await;
        let (sr, job) = h.schedule(&step, 3).await;

        h.queue.reserve(QueueName::Step).await.unwrap().unwrap();
        let sweep = h
            .queue
            .requeue_stalled(QueueName::Step, std::time::Duration::ZERO, 0)
            .await
            .unwrap();
        assert_eq!(sweep.failed.len(), 1);
        for stalled in sweep.failed {
            h.worker.on_stalled_out(stalled).await;
        }

        let stored = h.fx.repo.get_step_run(&sr.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some(STALLED_ERROR));

        let run = h.fx.repo.get_run(&job.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(
            run.error.as_deref(),
            Some(format!("Step '{}' failed after 1 attempts: {STALLED_ERROR}", step.id).as_str())
        );
    }

    #[tokio::test]
    async fn stalled_out_completed_step_still_continues_run() {
        let h = harness(vec![BoxTool::new(EchoTool::named("echo"))]).await;
        let step = h.fx.step("a", 1, json!({})).await;
        let (sr, job) = h.schedule(&step, 3).await;

        h.queue.reserve(QueueName::Step).await.unwrap().unwrap();
        h.fx
            .repo
            .update_step_run(
                &sr.id,
                &StepRunPatch::status(RunStatus::Completed).with_output(json!({})),
            )
            .await
            .unwrap();
        let sweep = h
            .queue
            .requeue_stalled(QueueName::Step, std::time::Duration::ZERO, 0)
            .await
            .unwrap();
        for stalled in sweep.failed {
            h.worker.on_stalled_out(stalled).await;
        }

        assert!(h.queue.get(&continue_job_id(&sr.id)).await.unwrap().is_some());
        let run = h.fx.repo.get_run(&job.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }
}
