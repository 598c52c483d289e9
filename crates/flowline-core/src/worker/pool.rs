//! Generic polling worker pool over a [`JobQueue`].
//!
//! The pool reserves due jobs from one logical queue and hands each to a
//! [`JobHandler`] on its own task. A semaphore caps in-flight jobs; an idle
//! queue is re-polled after `poll_interval`. Jobs whose reservation is older
//! than `stall_timeout` (their worker died) are periodically returned to the
//! queue; a job that stalls more than `max_stalls` times is failed instead
//! and handed to [`JobHandler::on_stalled_out`]. Shutdown is cooperative: the pool stops reserving and waits for
//! in-flight jobs to finish.

use std::sync::Arc;
use std::time::{Duration, Instant};

use flowline_types::error::QueueError;
use flowline_types::job::QueueName;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::queue::{JobQueue, QueuedJob};

/// Processes one reserved job and settles it on the queue
/// (complete, retry, or fail).
pub trait JobHandler: Send + Sync + 'static {
    fn handle(&self, job: QueuedJob) -> impl std::future::Future<Output = ()> + Send;

    /// Called once for a job the stall sweep failed. The queue has already
    /// settled it; the handler only records the outcome for its domain.
    fn on_stalled_out(&self, job: QueuedJob) -> impl std::future::Future<Output = ()> + Send;
}

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub queue: QueueName,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub stall_timeout: Duration,
    /// Stalls a job survives before the sweep fails it.
    pub max_stalls: u32,
}

pub struct WorkerPool<Q: JobQueue, H: JobHandler> {
    queue: Arc<Q>,
    handler: Arc<H>,
    config: PoolConfig,
}

impl<Q: JobQueue + 'static, H: JobHandler> WorkerPool<Q, H> {
    pub fn new(queue: Arc<Q>, handler: H, config: PoolConfig) -> Self {
        Self {
            queue,
            handler: Arc::new(handler),
            config,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Poll until `shutdown` fires, then drain in-flight jobs.
    pub async fn run(&self, shutdown: CancellationToken) {
        let queue_name = self.config.queue;
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let stall_check_every = (self.config.stall_timeout / 2).max(self.config.poll_interval);
        let mut last_stall_check: Option<Instant> = None;
        let mut tasks = JoinSet::new();

        tracing::info!(
            queue = %queue_name,
            concurrency = self.config.concurrency,
            "worker pool started"
        );

        loop {
            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    tracing::error!(queue = %queue_name, error = %e, "job task panicked");
                }
            }

            if last_stall_check.is_none_or(|at| at.elapsed() >= stall_check_every) {
                self.requeue_stalled().await;
                last_stall_check = Some(Instant::now());
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.queue.reserve(queue_name).await {
                Ok(Some(job)) => {
                    let handler = Arc::clone(&self.handler);
                    tasks.spawn(async move {
                        handler.handle(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if self.idle(&shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::warn!(queue = %queue_name, error = %e, "failed to reserve job");
                    if self.idle(&shutdown).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            queue = %queue_name,
            in_flight = tasks.len(),
            "worker pool stopping, draining in-flight jobs"
        );
        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                tracing::error!(queue = %queue_name, error = %e, "job task panicked");
            }
        }
        tracing::info!(queue = %queue_name, "worker pool stopped");
    }

    /// Handle every job that is due right now, one at a time, then return
    /// how many were handled.
    pub async fn process_available(&self) -> Result<usize, QueueError> {
        let mut handled = 0;
        while let Some(job) = self.queue.reserve(self.config.queue).await? {
            self.handler.handle(job).await;
            handled += 1;
        }
        Ok(handled)
    }

    /// Sleep one poll interval. Returns `true` if shutdown fired meanwhile.
    async fn idle(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => true,
            _ = tokio::time::sleep(self.config.poll_interval) => false,
        }
    }

    async fn requeue_stalled(&self) {
        match self
            .queue
            .requeue_stalled(
                self.config.queue,
                self.config.stall_timeout,
                self.config.max_stalls,
            )
            .await
        {
            Ok(sweep) => {
                if sweep.requeued > 0 {
                    tracing::warn!(
                        queue = %self.config.queue,
                        count = sweep.requeued,
                        "requeued stalled jobs"
                    );
                }
                for job in sweep.failed {
                    tracing::error!(
                        queue = %self.config.queue,
                        job_id = %job.id,
                        stalled_count = job.stalled_count,
                        "job failed after stalling too often"
                    );
                    self.handler.on_stalled_out(job).await;
                }
            }
            Err(e) => tracing::warn!(queue = %self.config.queue, error = %e, "stall recovery failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryQueue;
    use flowline_types::job::JobOptions;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        queue: Arc<InMemoryQueue>,
        handled: AtomicUsize,
        stalled_out: Mutex<Vec<String>>,
    }

    impl JobHandler for CountingHandler {
        async fn handle(&self, job: QueuedJob) {
            self.handled.fetch_add(1, Ordering::SeqCst);
            self.queue.complete(&job).await.unwrap();
        }

        async fn on_stalled_out(&self, job: QueuedJob) {
            self.stalled_out.lock().unwrap().push(job.id);
        }
    }

    fn pool(queue: &Arc<InMemoryQueue>) -> WorkerPool<InMemoryQueue, CountingHandler> {
        WorkerPool::new(
            Arc::clone(queue),
            CountingHandler {
                queue: Arc::clone(queue),
                handled: AtomicUsize::new(0),
                stalled_out: Mutex::new(Vec::new()),
            },
            PoolConfig {
                queue: QueueName::Step,
                concurrency: 2,
                poll_interval: Duration::from_millis(5),
                stall_timeout: Duration::from_secs(60),
                max_stalls: 1,
            },
        )
    }

    async fn seed(queue: &InMemoryQueue, n: usize) {
        for i in 0..n {
            queue
                .enqueue(
                    QueueName::Step,
                    &format!("job-{i}"),
                    &serde_json::json!({}),
                    &JobOptions::default(),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn process_available_handles_due_jobs() {
        let queue = Arc::new(InMemoryQueue::new());
        seed(&queue, 3).await;
        let pool = pool(&queue);

        assert_eq!(pool.process_available().await.unwrap(), 3);
        assert_eq!(pool.process_available().await.unwrap(), 0);
        assert_eq!(pool.handler().handled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_processes_jobs_until_shutdown() {
        let queue = Arc::new(InMemoryQueue::new());
        seed(&queue, 4).await;
        let pool = Arc::new(pool(&queue));
        let shutdown = CancellationToken::new();

        let runner = {
            let pool = Arc::clone(&pool);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.run(shutdown).await })
        };

        for _ in 0..200 {
            if pool.handler().handled.load(Ordering::SeqCst) == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        runner.await.unwrap();

        assert_eq!(pool.handler().handled.load(Ordering::SeqCst), 4);
        for job in queue.jobs(QueueName::Step) {
            assert_eq!(job.state, crate::queue::JobState::Completed);
        }
    }

    #[tokio::test]
    async fn stalled_jobs_are_requeued_on_start() {
        let queue = Arc::new(InMemoryQueue::new());
        seed(&queue, 1).await;
        // reserved by a worker that never finished
        queue.reserve(QueueName::Step).await.unwrap().unwrap();

        let mut pool = pool(&queue);
        pool.config.stall_timeout = Duration::ZERO;
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        pool.run(shutdown).await;

        let job = queue.get("job-0").await.unwrap().unwrap();
        assert_eq!(job.state, crate::queue::JobState::Waiting);
    }

    #[tokio::test]
    async fn repeatedly_stalled_job_is_failed_and_reported() {
        let queue = Arc::new(InMemoryQueue::new());
        seed(&queue, 1).await;
        let mut pool = pool(&queue);
        pool.config.stall_timeout = Duration::ZERO;

        // first stall: put back
        queue.reserve(QueueName::Step).await.unwrap().unwrap();
        pool.requeue_stalled().await;
        let job = queue.get("job-0").await.unwrap().unwrap();
        assert_eq!(job.state, crate::queue::JobState::Waiting);
        assert_eq!(job.stalled_count, 1);
        assert!(pool.handler().stalled_out.lock().unwrap().is_empty());

        // second stall: allowance spent
        queue.reserve(QueueName::Step).await.unwrap().unwrap();
        pool.requeue_stalled().await;
        let job = queue.get("job-0").await.unwrap().unwrap();
        assert_eq!(job.state, crate::queue::JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some(crate::queue::STALLED_ERROR));
        assert_eq!(*pool.handler().stalled_out.lock().unwrap(), ["job-0"]);
        assert!(queue.reserve(QueueName::Step).await.unwrap().is_none());
    }
}
