//! Worker runtime.
//!
//! A worker is a long-lived consumer bound to one queue. It pulls a message,
//! runs the handler in its own spawned task under a hard kill timer, and
//! translates the outcome back into a queue transition: success acknowledges,
//! a retryable handler error or panic fails the message as `error`, a
//! non-retryable handler error routes it as `dead`, and the kill timer fails
//! it as `timeout`. Handler crashes never take the worker down.

use crate::config::WorkerConfig;
use crate::dispatch::{Dispatch, Signal};
use crate::error::{QueueError, QueueResult};
use crate::message::{Flag, Message};
use crate::queue::QueueBackend;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Job handler function type. Receives the opaque payload of one message.
pub type JobHandler =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<(), QueueError>> + Send + Sync>;

/// Wraps an async closure into a [`JobHandler`].
pub fn handler<F, Fut>(f: F) -> JobHandler
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), QueueError>> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

/// What became of one handler invocation.
enum Outcome {
    Completed,
    Failed(String),
    Rejected(String),
    TimedOut,
}

/// A single queue consumer with its own control loop.
pub struct Worker<B: QueueBackend> {
    id: String,
    backend: Arc<B>,
    handler: JobHandler,
    config: WorkerConfig,
    wake_rx: broadcast::Receiver<Signal>,
    shutdown_rx: broadcast::Receiver<()>,
}

/// Handle to a spawned worker. Dropping the handle stops the worker at its
/// next loop iteration.
pub struct WorkerHandle {
    id: String,
    shutdown_tx: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// The worker's unique id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Requests the worker to stop. A worker mid-job finishes (or times out)
    /// that job first; its message is never orphaned by an orderly stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Requests a stop and waits for the control loop to exit.
    pub async fn stop_and_wait(self) {
        self.stop();
        let _ = self.join.await;
    }
}

impl<B: QueueBackend + 'static> Worker<B> {
    /// Spawns a worker that joins `config.group` on the given dispatch
    /// registry and begins polling immediately.
    pub fn spawn(
        backend: Arc<B>,
        handler: JobHandler,
        config: WorkerConfig,
        dispatch: &Dispatch,
    ) -> QueueResult<WorkerHandle> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self::spawn_with_shutdown(backend, handler, config, dispatch, shutdown_tx)
    }

    fn spawn_with_shutdown(
        backend: Arc<B>,
        handler: JobHandler,
        config: WorkerConfig,
        dispatch: &Dispatch,
        shutdown_tx: broadcast::Sender<()>,
    ) -> QueueResult<WorkerHandle> {
        config.validate()?;

        let id = format!("worker-{}", Uuid::new_v4());
        let worker = Worker {
            id: id.clone(),
            backend,
            handler,
            wake_rx: dispatch.join(&config.group),
            shutdown_rx: shutdown_tx.subscribe(),
            config,
        };
        info!(worker_id = %id, group = %worker.config.group, "worker started");

        let join = tokio::spawn(worker.run());
        Ok(WorkerHandle {
            id,
            shutdown_tx,
            join,
        })
    }

    async fn run(mut self) {
        loop {
            if self.should_stop() {
                break;
            }
            match self.backend.pull().await {
                Ok(Some(message)) => self.process(message).await,
                Ok(None) => {
                    if self.idle_wait().await {
                        break;
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "pull failed");
                    if self.idle_wait().await {
                        break;
                    }
                }
            }
        }
        info!(worker_id = %self.id, "worker stopped");
    }

    /// Runs one message in an isolated task and records the outcome.
    async fn process(&mut self, message: Message) {
        let payload = message.payload.clone();
        let job = Arc::clone(&self.handler);
        let mut task = tokio::spawn(async move { job(payload).await });

        let kill_timer = tokio::time::sleep(self.config.job_timeout());
        tokio::pin!(kill_timer);

        let outcome = tokio::select! {
            finished = &mut task => match finished {
                Ok(Ok(())) => Outcome::Completed,
                Ok(Err(e)) if e.is_retryable() => Outcome::Failed(e.to_string()),
                Ok(Err(e)) => Outcome::Rejected(e.to_string()),
                Err(e) if e.is_panic() => Outcome::Failed(format!("handler panicked: {e}")),
                Err(_) => Outcome::TimedOut,
            },
            _ = &mut kill_timer => {
                task.abort();
                let _ = (&mut task).await;
                Outcome::TimedOut
            }
        };

        // wake-ups that arrived while busy are discarded
        self.drain_wake_ups();

        let result = match outcome {
            Outcome::Completed => {
                debug!(worker_id = %self.id, timestamp_ms = message.timestamp_ms, "job completed");
                self.backend.acknowledge(message).await
            }
            Outcome::Failed(reason) => {
                warn!(
                    worker_id = %self.id,
                    timestamp_ms = message.timestamp_ms,
                    reason = %reason,
                    "job failed"
                );
                self.backend.fail(message, Flag::Error).await
            }
            Outcome::Rejected(reason) => {
                warn!(
                    worker_id = %self.id,
                    timestamp_ms = message.timestamp_ms,
                    reason = %reason,
                    "job failed with a non-retryable error, routing as dead"
                );
                self.backend.fail(message, Flag::Dead).await
            }
            Outcome::TimedOut => {
                warn!(
                    worker_id = %self.id,
                    timestamp_ms = message.timestamp_ms,
                    timeout_ms = self.config.job_timeout_ms,
                    "job timed out"
                );
                self.backend.fail(message, Flag::Timeout).await
            }
        };
        if let Err(e) = result {
            error!(worker_id = %self.id, error = %e, "failed to record job outcome");
        }
    }

    /// Waits for a wake-up, the idle poll timer, or shutdown. Returns true
    /// when the worker should stop.
    async fn idle_wait(&mut self) -> bool {
        use broadcast::error::RecvError;

        tokio::select! {
            _ = self.shutdown_rx.recv() => true,
            received = self.wake_rx.recv() => {
                if matches!(received, Err(RecvError::Closed)) {
                    // dispatch registry is gone; fall back to the poll timer
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
                false
            }
            _ = tokio::time::sleep(self.config.poll_interval()) => false,
        }
    }

    fn should_stop(&mut self) -> bool {
        use broadcast::error::TryRecvError;

        !matches!(self.shutdown_rx.try_recv(), Err(TryRecvError::Empty))
    }

    fn drain_wake_ups(&mut self) {
        use broadcast::error::TryRecvError;

        loop {
            match self.wake_rx.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }
}

/// A fixed-size set of workers sharing one queue, handler, and shutdown
/// signal.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerPool {
    /// Spawns `concurrency` workers, all joining `config.group`.
    pub fn start<B: QueueBackend + 'static>(
        concurrency: usize,
        backend: Arc<B>,
        handler: JobHandler,
        config: WorkerConfig,
        dispatch: &Dispatch,
    ) -> QueueResult<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut workers = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            workers.push(Worker::spawn_with_shutdown(
                Arc::clone(&backend),
                Arc::clone(&handler),
                config.clone(),
                dispatch,
                shutdown_tx.clone(),
            )?);
        }
        info!(concurrency, group = %config.group, "worker pool started");

        Ok(Self {
            workers,
            shutdown_tx,
        })
    }

    /// Number of workers in the pool.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// True when the pool holds no workers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Requests all workers to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Requests a stop and waits for every worker to exit.
    pub async fn shutdown(self) {
        self.stop();
        for worker in self.workers {
            let _ = worker.join.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::queue::Queue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::sleep;

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            poll_interval_ms: 25,
            ..WorkerConfig::default()
        }
    }

    fn counting_handler(
        counter: &Arc<AtomicUsize>,
        result: fn() -> Result<(), QueueError>,
    ) -> JobHandler {
        let counter = Arc::clone(counter);
        handler(move |_payload| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                result()
            }
        })
    }

    async fn open_queue(settings: QueueSettings) -> Arc<Queue> {
        Arc::new(Queue::open(settings).await.unwrap())
    }

    async fn panicking(_payload: Vec<u8>) -> Result<(), QueueError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_worker_processes_and_acknowledges() {
        let root = TempDir::new().unwrap();
        let queue = open_queue(QueueSettings::new(root.path(), "jobs")).await;
        let dispatch = Dispatch::new();

        queue.push(b"x").await.unwrap();

        let invocations = Arc::new(AtomicUsize::new(0));
        let worker = Worker::spawn(
            Arc::clone(&queue),
            counting_handler(&invocations, || Ok(())),
            fast_config(),
            &dispatch,
        )
        .unwrap();

        for _ in 0..200 {
            if invocations.load(Ordering::SeqCst) == 1 && queue.len().await.unwrap() == 0 {
                worker.stop_and_wait().await;
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("message was not processed in time");
    }

    #[tokio::test]
    async fn test_failing_handler_retries_then_dead_letters() {
        let root = TempDir::new().unwrap();
        let queue = open_queue(
            QueueSettings::new(root.path(), "jobs")
                .with_max_retries(Some(1))
                .with_dead_letters(QueueSettings::new(root.path(), "jobs_dead")),
        )
        .await;
        let dispatch = Dispatch::new();

        queue.push(b"p").await.unwrap();

        let invocations = Arc::new(AtomicUsize::new(0));
        let worker = Worker::spawn(
            Arc::clone(&queue),
            counting_handler(&invocations, || {
                Err(QueueError::ExecutionFailed("no thanks".into()))
            }),
            fast_config(),
            &dispatch,
        )
        .unwrap();

        for _ in 0..200 {
            if queue.dead_letter_len().await.unwrap() == 1 {
                worker.stop_and_wait().await;
                // initial attempt plus one retry
                assert_eq!(invocations.load(Ordering::SeqCst), 2);
                assert_eq!(queue.len().await.unwrap(), 0);

                let sink = queue.dead_letters().unwrap();
                let dead = sink.pull().await.unwrap().unwrap();
                assert!(dead.file_name().ends_with(".error.dead"));
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("message never reached the dead letters");
    }

    #[tokio::test]
    async fn test_non_retryable_error_skips_retries() {
        let root = TempDir::new().unwrap();
        let queue = open_queue(
            QueueSettings::new(root.path(), "jobs")
                .with_max_retries(Some(5))
                .with_dead_letters(QueueSettings::new(root.path(), "jobs_dead")),
        )
        .await;
        let dispatch = Dispatch::new();

        queue.push(b"p").await.unwrap();

        let invocations = Arc::new(AtomicUsize::new(0));
        let worker = Worker::spawn(
            Arc::clone(&queue),
            counting_handler(&invocations, || {
                Err(QueueError::Configuration("unusable payload".into()))
            }),
            fast_config(),
            &dispatch,
        )
        .unwrap();

        for _ in 0..200 {
            if queue.dead_letter_len().await.unwrap() == 1 {
                worker.stop_and_wait().await;
                // dead-lettered on the first attempt, retry cap untouched
                assert_eq!(invocations.load(Ordering::SeqCst), 1);
                assert_eq!(queue.len().await.unwrap(), 0);

                let sink = queue.dead_letters().unwrap();
                let dead = sink.pull().await.unwrap().unwrap();
                // no error attempts were recorded, only the dead routing
                assert_eq!(dead.attempts, [Flag::Dead]);
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("rejected message never reached the dead letters");
    }

    #[tokio::test]
    async fn test_slow_handler_is_killed_and_fails_as_timeout() {
        let root = TempDir::new().unwrap();
        let queue = open_queue(
            QueueSettings::new(root.path(), "jobs")
                .with_max_retries(Some(1))
                .with_dead_letters(QueueSettings::new(root.path(), "jobs_dead")),
        )
        .await;
        let dispatch = Dispatch::new();

        queue.push(b"p").await.unwrap();

        let config = WorkerConfig {
            job_timeout_ms: 100,
            poll_interval_ms: 25,
            ..WorkerConfig::default()
        };
        let worker = Worker::spawn(
            Arc::clone(&queue),
            handler(|_payload| async {
                sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
            config,
            &dispatch,
        )
        .unwrap();

        for _ in 0..200 {
            if queue.dead_letter_len().await.unwrap() == 1 {
                worker.stop_and_wait().await;

                let sink = queue.dead_letters().unwrap();
                let dead = sink.pull().await.unwrap().unwrap();
                assert!(
                    dead.file_name().ends_with(".timeout.dead"),
                    "unexpected name: {}",
                    dead.file_name()
                );
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("timed-out message never reached the dead letters");
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_as_error() {
        let root = TempDir::new().unwrap();
        let queue = open_queue(
            QueueSettings::new(root.path(), "jobs")
                .with_max_retries(Some(0))
                .with_dead_letters(QueueSettings::new(root.path(), "jobs_dead")),
        )
        .await;
        let dispatch = Dispatch::new();

        queue.push(b"p").await.unwrap();

        let worker = Worker::spawn(
            Arc::clone(&queue),
            handler(panicking),
            fast_config(),
            &dispatch,
        )
        .unwrap();

        for _ in 0..200 {
            if queue.dead_letter_len().await.unwrap() == 1 {
                worker.stop_and_wait().await;
                assert_eq!(queue.len().await.unwrap(), 0);
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("panicked job was not routed to the dead letters");
    }

    #[tokio::test]
    async fn test_broadcast_wakes_idle_worker() {
        let root = TempDir::new().unwrap();
        let queue = open_queue(QueueSettings::new(root.path(), "jobs")).await;
        let dispatch = Dispatch::new();

        // poll far slower than the test deadline: only a wake-up can explain
        // timely processing
        let config = WorkerConfig {
            poll_interval_ms: 60_000,
            ..WorkerConfig::default()
        };
        let invocations = Arc::new(AtomicUsize::new(0));
        let worker = Worker::spawn(
            Arc::clone(&queue),
            counting_handler(&invocations, || Ok(())),
            config,
            &dispatch,
        )
        .unwrap();

        // let the worker finish its startup pull and go idle
        sleep(Duration::from_millis(100)).await;

        queue.push(b"x").await.unwrap();
        assert_eq!(dispatch.broadcast("workers", Signal::PullJob), 1);

        for _ in 0..80 {
            if invocations.load(Ordering::SeqCst) == 1 {
                worker.stop_and_wait().await;
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("wake-up did not reach the idle worker");
    }

    #[tokio::test]
    async fn test_pool_processes_all_messages() {
        let root = TempDir::new().unwrap();
        let queue = open_queue(QueueSettings::new(root.path(), "jobs")).await;
        let dispatch = Dispatch::new();

        let invocations = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::start(
            3,
            Arc::clone(&queue),
            counting_handler(&invocations, || Ok(())),
            fast_config(),
            &dispatch,
        )
        .unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(dispatch.group_size("workers"), 3);

        for _ in 0..10 {
            queue.push(b"work").await.unwrap();
            dispatch.broadcast("workers", Signal::PullJob);
        }

        for _ in 0..200 {
            if invocations.load(Ordering::SeqCst) == 10 && queue.len().await.unwrap() == 0 {
                pool.shutdown().await;
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("pool did not drain the queue in time");
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_spawn() {
        let root = TempDir::new().unwrap();
        let queue = open_queue(QueueSettings::new(root.path(), "jobs")).await;
        let dispatch = Dispatch::new();

        let config = WorkerConfig {
            job_timeout_ms: 0,
            ..WorkerConfig::default()
        };
        let result = Worker::spawn(queue, handler(|_p| async { Ok(()) }), config, &dispatch);
        assert!(matches!(result, Err(QueueError::Configuration(_))));
    }
}
