//! The worker: claim, resolve, OCR, push, acknowledge.
//!
//! Workers share nothing but the queue. Each claimed task runs the full
//! pipeline; the outcome decides what happens to the task: success acks it,
//! a transient failure hands it back for retry, a fatal failure
//! dead-letters it on the spot.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TryRecvError};
use uuid::Uuid;

use crate::{
    error::{RelayError, RelayResult},
    ocr::{self, OcrProvider},
    paths::PathResolver,
    prelude::*,
    queue::{RequeueOutcome, Task, TaskQueue},
    sync::{CancelSignal, PushProtocol, PushReport, Synchronizer},
};

/// Cancellation probe backed by the task's queue row, so an operator's
/// cancel request reaches a worker that already claimed the task.
struct QueueCancel<'a> {
    queue: &'a TaskQueue,
    job_id: Uuid,
}

#[async_trait]
impl CancelSignal for QueueCancel<'_> {
    async fn is_cancelled(&self) -> bool {
        // A failed lookup means we can't know; carry on rather than abort.
        self.queue
            .is_cancel_requested(self.job_id)
            .await
            .unwrap_or(false)
    }
}

/// One worker in the pool.
pub struct Worker {
    queue: TaskQueue,
    resolver: PathResolver,
    provider: Arc<dyn OcrProvider>,
    synchronizer: Synchronizer,
    protocol: PushProtocol,
    ocr_timeout: Duration,
    poll_interval: Duration,
    worker_id: String,
}

impl Worker {
    pub fn new(
        queue: TaskQueue,
        resolver: PathResolver,
        provider: Arc<dyn OcrProvider>,
        synchronizer: Synchronizer,
        protocol: PushProtocol,
        ocr_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        let worker_id = format!("worker-{}-{}", std::process::id(), Uuid::new_v4());
        Self {
            queue,
            resolver,
            provider,
            synchronizer,
            protocol,
            ocr_timeout,
            poll_interval,
            worker_id,
        }
    }

    /// Poll the queue until a shutdown message arrives.
    ///
    /// Shutdown is honored between tasks, never mid-task: a claimed task
    /// must reach ack, requeue, or dead-letter before the worker exits, or
    /// it would be stranded in the claimed state.
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) -> RelayResult<()> {
        info!(worker_id = %self.worker_id, "worker started");
        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }
            match self.try_process_next().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "queue operation failed");
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
        info!(worker_id = %self.worker_id, "shutdown requested, worker stopping");
        Ok(())
    }

    /// Claim and process at most one task. Returns whether a task was
    /// claimed, so callers can decide to poll again or sleep.
    pub async fn try_process_next(&self) -> RelayResult<bool> {
        let Some(task) = self.queue.claim_next(&self.worker_id).await? else {
            return Ok(false);
        };

        info!(
            job_id = %task.job_id,
            logical_path = %task.logical_path,
            attempt = task.attempt_count + 1,
            "processing task"
        );
        match self.execute(&task).await {
            Ok(report) => {
                self.queue.ack(task.job_id).await?;
                info!(
                    job_id = %task.job_id,
                    object_id = report.object_id,
                    file_identifier = report.file_identifier,
                    "task completed"
                );
            }
            Err(e) if e.is_transient() => {
                warn!(job_id = %task.job_id, error = %e, "task failed, will retry");
                if let RequeueOutcome::DeadLettered =
                    self.queue.requeue(task.job_id, &e).await?
                {
                    error!(job_id = %task.job_id, "task exhausted its attempts");
                }
            }
            Err(e) => {
                error!(job_id = %task.job_id, error = %e, "task failed fatally");
                self.queue.dead_letter(task.job_id, &e).await?;
            }
        }
        Ok(true)
    }

    #[instrument(level = "debug", skip_all, fields(job_id = %task.job_id))]
    async fn execute(&self, task: &Task) -> RelayResult<PushReport> {
        let physical_path = self.resolver.resolve(&task.logical_path);
        let cancel = QueueCancel {
            queue: &self.queue,
            job_id: task.job_id,
        };

        let ocr = tokio::time::timeout(
            self.ocr_timeout,
            ocr::run_ocr(self.provider.as_ref(), &physical_path),
        )
        .await
        .map_err(|_| RelayError::Timeout {
            phase: "ocr",
            timeout: self.ocr_timeout,
        })??;

        self.synchronizer
            .push(&ocr, task.collection_id.as_deref(), self.protocol, &cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Write as _;

    use super::*;
    use crate::ocr::mock::MockOcrProvider;
    use crate::repository::mock::MockRepository;

    async fn memory_queue(max_attempts: u32) -> TaskQueue {
        TaskQueue::connect("sqlite::memory:", max_attempts, Duration::from_secs(600))
            .await
            .unwrap()
    }

    fn worker(
        queue: TaskQueue,
        default_root: PathBuf,
        provider: Arc<MockOcrProvider>,
        repo: Arc<MockRepository>,
    ) -> Worker {
        Worker::new(
            queue,
            PathResolver::new(default_root, BTreeMap::new()),
            provider,
            Synchronizer::new(repo),
            PushProtocol::FileFirst,
            Duration::from_secs(30),
            Duration::from_millis(10),
        )
    }

    fn write_file(dir: &Path, name: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(b"pretend image bytes").unwrap();
    }

    #[tokio::test]
    async fn processes_a_task_end_to_end() {
        let dir = tempfile::TempDir::with_prefix("worker").unwrap();
        write_file(dir.path(), "page1.jpg");

        let queue = memory_queue(3).await;
        queue.enqueue("page1.jpg", Some("c1")).await.unwrap();

        let provider = Arc::new(MockOcrProvider::new().with_text("hello"));
        let repo = Arc::new(MockRepository::new());
        let worker = worker(
            queue.clone(),
            dir.path().to_owned(),
            provider.clone(),
            repo.clone(),
        );

        assert!(worker.try_process_next().await.unwrap());
        assert_eq!(provider.call_count(), 1);
        assert_eq!(repo.object_count(), 1);
        assert_eq!(queue.pending_count().await.unwrap(), 0);

        // Queue drained.
        assert!(!worker.try_process_next().await.unwrap());
    }

    #[tokio::test]
    async fn missing_file_dead_letters_without_touching_the_repository() {
        let dir = tempfile::TempDir::with_prefix("worker").unwrap();

        let queue = memory_queue(3).await;
        queue.enqueue("does-not-exist.jpg", None).await.unwrap();

        let provider = Arc::new(MockOcrProvider::new());
        let repo = Arc::new(MockRepository::new());
        let worker = worker(
            queue.clone(),
            dir.path().to_owned(),
            provider.clone(),
            repo.clone(),
        );

        assert!(worker.try_process_next().await.unwrap());
        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt_count, 1);
        assert_eq!(dead[0].last_error_kind, "file_not_found");
        assert_eq!(provider.call_count(), 0);
        assert_eq!(repo.upload_calls(), 0);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_dead_letter() {
        let dir = tempfile::TempDir::with_prefix("worker").unwrap();
        write_file(dir.path(), "page1.jpg");

        let queue = memory_queue(3).await;
        queue.enqueue("page1.jpg", None).await.unwrap();

        let provider = Arc::new(MockOcrProvider::new().with_text("hello"));
        // Every upload fails, so every attempt is a transient failure.
        let repo = Arc::new(MockRepository::new().with_upload_failures(u32::MAX));
        let worker = worker(
            queue.clone(),
            dir.path().to_owned(),
            provider,
            repo.clone(),
        );

        for _ in 0..3 {
            assert!(worker.try_process_next().await.unwrap());
        }
        assert!(!worker.try_process_next().await.unwrap());

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt_count, 3);
        assert_eq!(dead[0].attempt_history.len(), 3);
        assert_eq!(dead[0].last_error_kind, "upload");
        assert_eq!(repo.object_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_lets_the_in_flight_task_finish() {
        let dir = tempfile::TempDir::with_prefix("worker").unwrap();
        write_file(dir.path(), "page1.jpg");

        let queue = memory_queue(3).await;
        queue.enqueue("page1.jpg", None).await.unwrap();

        let provider = Arc::new(
            MockOcrProvider::new()
                .with_text("hello")
                .with_delay(Duration::from_millis(300)),
        );
        let repo = Arc::new(MockRepository::new());
        let worker = worker(
            queue.clone(),
            dir.path().to_owned(),
            provider,
            repo.clone(),
        );

        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        // Let the worker claim the task and start the slow OCR call, then
        // request shutdown while it is still in flight.
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).await.unwrap();
        handle.await.unwrap().unwrap();

        // The claimed task ran to completion instead of being stranded.
        assert_eq!(repo.object_count(), 1);
        assert_eq!(queue.pending_count().await.unwrap(), 0);
        assert!(queue.dead_letters().await.unwrap().is_empty());
        assert!(queue.claim_next("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelled_task_is_never_picked_up() {
        let dir = tempfile::TempDir::with_prefix("worker").unwrap();
        write_file(dir.path(), "page1.jpg");

        let queue = memory_queue(3).await;
        let job_id = queue.enqueue("page1.jpg", None).await.unwrap();
        queue.request_cancel(job_id).await.unwrap();

        let provider = Arc::new(MockOcrProvider::new().with_text("hello"));
        let repo = Arc::new(MockRepository::new());
        let worker = worker(
            queue.clone(),
            dir.path().to_owned(),
            provider.clone(),
            repo,
        );

        assert!(!worker.try_process_next().await.unwrap());
        assert_eq!(provider.call_count(), 0);
    }
}
