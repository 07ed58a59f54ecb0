//! Per-queue pool of concurrent executors. Mirrors the dequeue → dispatch → requeue-or-complete
//! cycle specified for a single queue, with a semaphore gate bounding in-flight work and a
//! supervisor that restarts any executor loop that exits abnormally.

use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use taskbroker_graceful_shutdown::GracefulShutdownConsumer;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::error::Error;
use crate::queue::Queue;
use crate::registry::TaskRegistry;
use crate::task::Task;

const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
const EMPTY_QUEUE_SLEEP: Duration = Duration::from_secs(1);
const SUPERVISOR_RESTART_SLEEP: Duration = Duration::from_secs(1);

pub struct WorkerPool {
    executors: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `concurrency` supervised executors draining `queue`. Each executor acquires a slot
    /// from a shared gate of that same size before dequeuing, so the pool never has more than
    /// `concurrency` handler calls in flight even while an executor is mid-restart.
    pub fn start(
        queue: Arc<Queue>,
        registry: Arc<TaskRegistry>,
        concurrency: u32,
        retry_limit: u32,
        shutdown: GracefulShutdownConsumer,
    ) -> WorkerPool {
        let gate = Arc::new(Semaphore::new(concurrency as usize));

        let executors = (0..concurrency)
            .map(|i| {
                tokio::spawn(supervisor_loop(
                    i,
                    queue.clone(),
                    registry.clone(),
                    gate.clone(),
                    retry_limit,
                    shutdown.clone(),
                ))
            })
            .collect();

        WorkerPool { executors }
    }

    /// Cancel every executor and wait for them to finish. Errors from cancelled tasks are
    /// suppressed; after this returns the pool holds no resources.
    pub async fn stop(self) {
        for handle in &self.executors {
            handle.abort();
        }
        for handle in self.executors {
            let _ = handle.await;
        }
    }
}

/// Catches a panic out of `work_loop` with `catch_unwind` rather than spawning it as a separate
/// task, so aborting this executor's own `JoinHandle` (see [`WorkerPool::stop`]) still cancels
/// the work loop cleanly instead of leaving it running orphaned. A clean `Shutdown` exit ends
/// the supervisor; a panic is logged and the work loop is restarted after a short sleep.
async fn supervisor_loop(
    executor_id: u32,
    queue: Arc<Queue>,
    registry: Arc<TaskRegistry>,
    gate: Arc<Semaphore>,
    retry_limit: u32,
    mut shutdown: GracefulShutdownConsumer,
) {
    loop {
        if shutdown.shutting_down() {
            return;
        }

        let attempt = std::panic::AssertUnwindSafe(work_loop(
            executor_id,
            queue.clone(),
            registry.clone(),
            gate.clone(),
            retry_limit,
            shutdown.clone(),
        ))
        .catch_unwind()
        .await;

        match attempt {
            Ok(WorkLoopExit::Shutdown) => return,
            Err(_panic) => {
                event!(
                    Level::ERROR,
                    queue = %queue.name(),
                    executor = executor_id,
                    "Executor panicked, restarting"
                );
                tokio::time::sleep(SUPERVISOR_RESTART_SLEEP).await;
            }
        }
    }
}

enum WorkLoopExit {
    Shutdown,
}

async fn work_loop(
    executor_id: u32,
    queue: Arc<Queue>,
    registry: Arc<TaskRegistry>,
    gate: Arc<Semaphore>,
    retry_limit: u32,
    mut shutdown: GracefulShutdownConsumer,
) -> WorkLoopExit {
    loop {
        let permit = tokio::select! {
            biased;
            _ = shutdown.wait_for_shutdown() => return WorkLoopExit::Shutdown,
            permit = gate.acquire() => permit,
        };
        let permit = match permit {
            Ok(permit) => permit,
            Err(_) => return WorkLoopExit::Shutdown,
        };

        match queue.dequeue(DEQUEUE_TIMEOUT).await {
            Ok(Some(task)) => {
                process_task(&queue, &registry, task, retry_limit).await;
            }
            Ok(None) => {
                drop(permit);
                tokio::time::sleep(EMPTY_QUEUE_SLEEP).await;
                continue;
            }
            Err(e) => {
                event!(
                    Level::ERROR,
                    queue = %queue.name(),
                    executor = executor_id,
                    error = %e,
                    "Error dequeueing task"
                );
                drop(permit);
                tokio::time::sleep(EMPTY_QUEUE_SLEEP).await;
                continue;
            }
        }

        drop(permit);
    }
}

/// Dispatch a single task to its handler, then unconditionally clear its sidecar entry. This is
/// the one place the sidecar copy is ever removed: after retry exhaustion the task is gone from
/// both lists with no further invocation. The dispatch is wrapped in `catch_unwind` so a handler
/// panic still reaches this finally step instead of unwinding past it and stranding the sidecar
/// entry until the next startup `recover`; a panic is treated the same as a returned error.
async fn process_task(queue: &Queue, registry: &TaskRegistry, mut task: Task, retry_limit: u32) {
    task.mark_started();
    let id = task.id.clone();

    let dispatch = std::panic::AssertUnwindSafe(registry.dispatch(queue.name(), task.kwargs.clone()))
        .catch_unwind()
        .await;

    let outcome = match dispatch {
        Ok(outcome) => outcome,
        Err(_panic) => {
            event!(
                Level::ERROR,
                queue = %queue.name(),
                task = %id,
                "Handler panicked"
            );
            Ok(Err(anyhow::anyhow!("handler panicked")))
        }
    };

    if let Err(e) = &outcome {
        if matches!(e, Error::FunctionNotFoundError(_)) {
            event!(
                Level::ERROR,
                queue = %queue.name(),
                task = %id,
                "No handler registered for this queue"
            );
        }
    }

    let failed = match &outcome {
        Ok(Ok(())) => false,
        Ok(Err(handler_err)) => {
            event!(
                Level::WARN,
                queue = %queue.name(),
                task = %id,
                error = %handler_err,
                "Handler failed"
            );
            true
        }
        Err(Error::Timeout { .. }) => {
            event!(
                Level::WARN,
                queue = %queue.name(),
                task = %id,
                "Handler timed out"
            );
            true
        }
        Err(e) => {
            event!(
                Level::ERROR,
                queue = %queue.name(),
                task = %id,
                error = %e,
                "Dispatch failed"
            );
            true
        }
    };

    if failed {
        if task.retry_count < retry_limit {
            task.retry_count += 1;
            let retry_count = task.retry_count;
            if let Err(e) = queue.requeue(task).await {
                event!(
                    Level::ERROR,
                    queue = %queue.name(),
                    task = %id,
                    error = %e,
                    "Failed to requeue task, it will be lost after sidecar cleanup"
                );
            } else {
                event!(Level::INFO, queue = %queue.name(), task = %id, retry_count, "Requeued task");
            }
        } else {
            event!(
                Level::WARN,
                queue = %queue.name(),
                task = %id,
                retry_count = task.retry_count,
                "Task exhausted its retry budget; terminal failure"
            );
        }
    }

    if let Err(e) = queue.mark_complete(&id).await {
        event!(
            Level::ERROR,
            queue = %queue.name(),
            task = %id,
            error = %e,
            "Failed to clear processing entry"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Handler;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taskbroker_graceful_shutdown::GracefulShutdown;

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail_until: usize,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn call(&self, _kwargs: Map<String, serde_json::Value>) -> Result<(), anyhow::Error> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_until {
                anyhow::bail!("synthetic failure {}", n);
            }
            Ok(())
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !condition() {
            if tokio::time::Instant::now() >= deadline {
                panic!("condition not met within timeout");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_drained(queue: &Queue, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if queue.count().await.unwrap() == 0 && queue.count_processing().await.unwrap() == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("queue did not drain within timeout");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn happy_path_runs_handler_once_and_drains_both_lists() {
        let queue = Arc::new(Queue::new(Arc::new(MemoryStore::new()), "q"));
        let registry = Arc::new(TaskRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .register(
                "q",
                Arc::new(CountingHandler {
                    calls: calls.clone(),
                    fail_until: 0,
                }),
                1,
                None,
            )
            .await;

        let mut kwargs = Map::new();
        kwargs.insert("x".into(), serde_json::json!(1));
        kwargs.insert("y".into(), serde_json::json!(2));
        queue.enqueue(kwargs).await.unwrap();

        let shutdown = GracefulShutdown::new();
        let pool = WorkerPool::start(queue.clone(), registry, 1, 3, shutdown.consumer());

        wait_until(|| calls.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await;
        wait_for_drained(&queue, Duration::from_secs(2)).await;

        pool.stop().await;
    }

    #[tokio::test]
    async fn retry_then_succeed_sees_incremented_retry_count() {
        let queue = Arc::new(Queue::new(Arc::new(MemoryStore::new()), "q"));
        let registry = Arc::new(TaskRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .register(
                "q",
                Arc::new(CountingHandler {
                    calls: calls.clone(),
                    fail_until: 1,
                }),
                1,
                None,
            )
            .await;

        queue.enqueue(Map::new()).await.unwrap();

        let shutdown = GracefulShutdown::new();
        let pool = WorkerPool::start(queue.clone(), registry, 1, 3, shutdown.consumer());

        wait_until(|| calls.load(Ordering::SeqCst) == 2, Duration::from_secs(2)).await;
        wait_for_drained(&queue, Duration::from_secs(2)).await;

        pool.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_exhaustion_stops_after_limit_plus_one_invocations() {
        let queue = Arc::new(Queue::new(Arc::new(MemoryStore::new()), "q"));
        let registry = Arc::new(TaskRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .register(
                "q",
                Arc::new(CountingHandler {
                    calls: calls.clone(),
                    fail_until: usize::MAX,
                }),
                1,
                None,
            )
            .await;

        queue.enqueue(Map::new()).await.unwrap();

        let shutdown = GracefulShutdown::new();
        let pool = WorkerPool::start(queue.clone(), registry, 1, 2, shutdown.consumer());

        wait_until(|| calls.load(Ordering::SeqCst) == 3, Duration::from_secs(2)).await;
        wait_for_drained(&queue, Duration::from_secs(2)).await;

        // Give a little longer to make sure no further invocation sneaks in.
        tokio::time::sleep(Duration::from_millis(200)).await;
        pool.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn handler_timeout_is_treated_as_retryable_failure() {
        let queue = Arc::new(Queue::new(Arc::new(MemoryStore::new()), "q"));
        let registry = Arc::new(TaskRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));

        struct SleepyHandler(Arc<AtomicUsize>);
        #[async_trait]
        impl Handler for SleepyHandler {
            async fn call(&self, _kwargs: Map<String, serde_json::Value>) -> Result<(), anyhow::Error> {
                self.0.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }
        }

        registry
            .register(
                "q",
                Arc::new(SleepyHandler(calls.clone())),
                1,
                Some(Duration::from_millis(50)),
            )
            .await;

        queue.enqueue(Map::new()).await.unwrap();

        let shutdown = GracefulShutdown::new();
        let pool = WorkerPool::start(queue.clone(), registry, 1, 1, shutdown.consumer());

        wait_until(|| calls.load(Ordering::SeqCst) == 2, Duration::from_secs(3)).await;
        wait_for_drained(&queue, Duration::from_secs(2)).await;

        pool.stop().await;
    }

    #[tokio::test]
    async fn handler_panic_still_clears_the_sidecar_entry() {
        let queue = Arc::new(Queue::new(Arc::new(MemoryStore::new()), "q"));
        let registry = Arc::new(TaskRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));

        struct PanickyHandler(Arc<AtomicUsize>);
        #[async_trait]
        impl Handler for PanickyHandler {
            async fn call(&self, _kwargs: Map<String, serde_json::Value>) -> Result<(), anyhow::Error> {
                self.0.fetch_add(1, Ordering::SeqCst);
                panic!("synthetic handler panic");
            }
        }

        registry
            .register("q", Arc::new(PanickyHandler(calls.clone())), 1, None)
            .await;

        queue.enqueue(Map::new()).await.unwrap();

        let shutdown = GracefulShutdown::new();
        let pool = WorkerPool::start(queue.clone(), registry, 1, 0, shutdown.consumer());

        wait_until(|| calls.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await;
        wait_for_drained(&queue, Duration::from_secs(2)).await;

        pool.stop().await;
    }
}
