//! Reconciles desired queue state (held in the store) against live worker pools. Runs as its own
//! 5s tick loop, in the same `tokio::select!` shutdown-race style as the scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use taskbroker_graceful_shutdown::GracefulShutdownConsumer;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::queue::{Queue, QueueStatus};
use crate::registry::TaskRegistry;
use crate::worker::WorkerPool;

const TICK_INTERVAL: Duration = Duration::from_secs(5);

struct ManagedQueue {
    queue: Arc<Queue>,
    concurrency: u32,
    retry_limit: u32,
    pool: Option<WorkerPool>,
    status: QueueStatus,
}

/// Owns every registered queue's live pool and the in-memory mirror of its status. Reconciling
/// and explicit `pause` both go through the same `transition` helper so the two can never
/// disagree about what "already paused" means.
pub struct ControlPlane {
    queues: Mutex<HashMap<String, ManagedQueue>>,
    registry: Arc<TaskRegistry>,
    shutdown: GracefulShutdownConsumer,
}

impl ControlPlane {
    pub fn new(registry: Arc<TaskRegistry>, shutdown: GracefulShutdownConsumer) -> ControlPlane {
        ControlPlane {
            queues: Mutex::new(HashMap::new()),
            registry,
            shutdown,
        }
    }

    /// Register a queue with a freshly started pool. Called once per queue during coordinator
    /// startup, after `recover` has already run.
    pub async fn add_queue(&self, queue: Arc<Queue>, concurrency: u32, retry_limit: u32) {
        let pool = WorkerPool::start(
            queue.clone(),
            self.registry.clone(),
            concurrency,
            retry_limit,
            self.shutdown.clone(),
        );
        self.queues.lock().await.insert(
            queue.name().to_string(),
            ManagedQueue {
                queue,
                concurrency,
                retry_limit,
                pool: Some(pool),
                status: QueueStatus::Running,
            },
        );
    }

    /// Explicit pause, independent of the reconcile tick. Returns `false` if the queue was
    /// already paused.
    pub async fn pause(&self, queue_name: &str, duration: Duration) -> Result<bool, crate::error::Error> {
        let mut queues = self.queues.lock().await;
        let managed = queues
            .get_mut(queue_name)
            .ok_or_else(|| crate::error::Error::FunctionNotFoundError(queue_name.to_string()))?;

        if !managed.queue.pause(duration).await? {
            return Ok(false);
        }

        transition_to_paused(managed).await;
        Ok(true)
    }

    pub async fn status(&self, queue_name: &str) -> Option<QueueStatus> {
        self.queues.lock().await.get(queue_name).map(|q| q.status)
    }

    /// Run the 5s reconcile loop until shutdown, then stop every live pool.
    pub async fn run(&self, mut shutdown: GracefulShutdownConsumer) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(TICK_INTERVAL) => {},
                _ = shutdown.wait_for_shutdown() => break,
            }
            self.reconcile_once().await;
        }

        let mut queues = self.queues.lock().await;
        for managed in queues.values_mut() {
            if let Some(pool) = managed.pool.take() {
                pool.stop().await;
            }
        }
    }

    async fn reconcile_once(&self) {
        let mut queues = self.queues.lock().await;
        for managed in queues.values_mut() {
            let desired = match managed.queue.status().await {
                Ok(status) => status,
                Err(e) => {
                    event!(Level::ERROR, queue = %managed.queue.name(), error = %e, "Failed to read queue status");
                    continue;
                }
            };

            match (managed.status, desired) {
                (QueueStatus::Running, QueueStatus::Paused) => transition_to_paused(managed).await,
                (QueueStatus::Paused, QueueStatus::Running) => transition_to_running(managed, self).await,
                _ => {}
            }
        }
    }
}

async fn transition_to_paused(managed: &mut ManagedQueue) {
    if let Some(pool) = managed.pool.take() {
        pool.stop().await;
    }
    if let Err(e) = managed.queue.drain_processing_to_head().await {
        event!(Level::ERROR, queue = %managed.queue.name(), error = %e, "Failed to drain processing entries on pause");
    }
    managed.status = QueueStatus::Paused;
    event!(Level::INFO, queue = %managed.queue.name(), "Queue paused");
}

async fn transition_to_running(managed: &mut ManagedQueue, plane: &ControlPlane) {
    managed.pool = Some(WorkerPool::start(
        managed.queue.clone(),
        plane.registry.clone(),
        managed.concurrency,
        managed.retry_limit,
        plane.shutdown.clone(),
    ));
    managed.status = QueueStatus::Running;
    event!(Level::INFO, queue = %managed.queue.name(), "Queue resumed");
}

pub fn spawn(plane: Arc<ControlPlane>, shutdown: GracefulShutdownConsumer) -> JoinHandle<()> {
    tokio::spawn(async move { plane.run(shutdown).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Handler;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::Map;
    use taskbroker_graceful_shutdown::GracefulShutdown;

    struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {
        async fn call(&self, _kwargs: Map<String, serde_json::Value>) -> Result<(), anyhow::Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn explicit_pause_stops_the_pool_and_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(Queue::new(store, "q"));
        let registry = Arc::new(TaskRegistry::new());
        registry.register("q", Arc::new(NoopHandler), 1, None).await;

        let shutdown = GracefulShutdown::new();
        let plane = ControlPlane::new(registry, shutdown.consumer());
        plane.add_queue(queue.clone(), 1, 3).await;

        assert!(plane.pause("q", Duration::from_secs(30)).await.unwrap());
        assert_eq!(plane.status("q").await, Some(QueueStatus::Paused));
        assert!(!plane.pause("q", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn reconcile_picks_up_an_externally_set_pause() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(Queue::new(store, "q"));
        let registry = Arc::new(TaskRegistry::new());
        registry.register("q", Arc::new(NoopHandler), 1, None).await;

        let shutdown = GracefulShutdown::new();
        let plane = ControlPlane::new(registry, shutdown.consumer());
        plane.add_queue(queue.clone(), 1, 3).await;

        queue.pause(Duration::from_secs(30)).await.unwrap();
        plane.reconcile_once().await;

        assert_eq!(plane.status("q").await, Some(QueueStatus::Paused));
    }
}
