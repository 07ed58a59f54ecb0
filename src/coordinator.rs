//! Top-level lifecycle: wires together the store, the task registry, every registered queue's
//! pool, the scheduler, and the control plane, and drives them until shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Map;
use taskbroker_graceful_shutdown::{GracefulShutdown, GracefulShutdownConsumer};
use tokio::sync::Mutex;
use tracing::{event, Level};

use crate::control::ControlPlane;
use crate::error::Error;
use crate::queue::Queue;
use crate::registry::{Handler, TaskRegistry};
use crate::scheduler::{Scheduler, Trigger};
use crate::service_config::Config;
use crate::store::{RedisStore, Store};

const STATUS_REPORT_INTERVAL: Duration = Duration::from_secs(300);

struct QueueRegistration {
    queue: Arc<Queue>,
    concurrency: u32,
}

/// Accumulates queue and trigger registrations before `run` starts anything. Registration is
/// expected to happen entirely before `run` is called; nothing here is safe to mutate
/// concurrently with a running coordinator.
pub struct Coordinator {
    store: Arc<dyn Store>,
    registry: Arc<TaskRegistry>,
    queues: HashMap<String, QueueRegistration>,
    scheduler: Mutex<Option<Scheduler>>,
    retry_limit: u32,
    shutdown: Mutex<GracefulShutdown>,
    control_plane: Arc<ControlPlane>,
}

impl Coordinator {
    pub fn new(config: &Config) -> Result<Coordinator, Error> {
        let store = Arc::new(RedisStore::from_url(&config.store_url)?);
        let registry = Arc::new(TaskRegistry::new());
        let shutdown = GracefulShutdown::new();
        let control_plane = Arc::new(ControlPlane::new(registry.clone(), shutdown.consumer()));
        Ok(Coordinator {
            store,
            registry,
            queues: HashMap::new(),
            scheduler: Mutex::new(Some(Scheduler::new())),
            retry_limit: config.retry_limit,
            shutdown: Mutex::new(shutdown),
            control_plane,
        })
    }

    #[cfg(test)]
    pub fn with_store(store: Arc<dyn Store>, retry_limit: u32) -> Coordinator {
        let registry = Arc::new(TaskRegistry::new());
        let shutdown = GracefulShutdown::new();
        let control_plane = Arc::new(ControlPlane::new(registry.clone(), shutdown.consumer()));
        Coordinator {
            store,
            registry,
            queues: HashMap::new(),
            scheduler: Mutex::new(Some(Scheduler::new())),
            retry_limit,
            shutdown: Mutex::new(shutdown),
            control_plane,
        }
    }

    pub async fn shutdown_consumer(&self) -> GracefulShutdownConsumer {
        self.shutdown.lock().await.consumer()
    }

    /// Signal every running loop to stop. `run` observes this and returns once all of them
    /// have been joined.
    pub async fn trigger_shutdown(&self) {
        self.shutdown.lock().await.shutdown();
    }

    /// Bind a handler to a queue. `concurrency` sizes that queue's pool; pass `0` to fall back
    /// to twice the machine's CPU count. `timeout`, if set, bounds each invocation of the
    /// handler.
    pub async fn register_queue(
        &mut self,
        queue_name: &str,
        handler: Arc<dyn Handler>,
        concurrency: u32,
        timeout: Option<Duration>,
    ) {
        let concurrency = if concurrency == 0 {
            (num_cpus::get() * 2) as u32
        } else {
            concurrency
        };
        self.registry
            .register(queue_name, handler, concurrency, timeout)
            .await;
        self.queues.insert(
            queue_name.to_string(),
            QueueRegistration {
                queue: Arc::new(Queue::new(self.store.clone(), queue_name)),
                concurrency,
            },
        );
    }

    pub fn register_interval_trigger(
        &mut self,
        name: &str,
        period: Duration,
        handler: Arc<dyn Handler>,
        payload: Map<String, serde_json::Value>,
    ) {
        self.scheduler
            .get_mut()
            .as_mut()
            .expect("scheduler not yet taken by run()")
            .add(name, Trigger::interval(period), handler, payload);
    }

    pub fn register_cron_trigger(
        &mut self,
        name: &str,
        expression: &str,
        handler: Arc<dyn Handler>,
        payload: Map<String, serde_json::Value>,
    ) -> Result<(), Error> {
        let trigger = Trigger::cron(expression)?;
        self.scheduler
            .get_mut()
            .as_mut()
            .expect("scheduler not yet taken by run()")
            .add(name, trigger, handler, payload);
        Ok(())
    }

    pub async fn enqueue(
        &self,
        queue_name: &str,
        kwargs: Map<String, serde_json::Value>,
    ) -> Result<String, Error> {
        let registration = self
            .queues
            .get(queue_name)
            .ok_or_else(|| Error::FunctionNotFoundError(queue_name.to_string()))?;
        registration.queue.enqueue(kwargs).await
    }

    /// Pause a queue immediately through the live [`ControlPlane`]: this stops its pool and
    /// drains the processing sidecar right away, rather than writing the status key and waiting
    /// for the next 5s reconcile tick to notice it. Only reachable once `run()` has registered
    /// the queue with the control plane.
    pub async fn pause(&self, queue_name: &str, duration: Duration) -> Result<bool, Error> {
        self.control_plane.pause(queue_name, duration).await
    }

    /// Connect, recover every queue, start pools and background loops, then block until
    /// shutdown is signalled (Ctrl-C or an explicit call on the held [`GracefulShutdown`]).
    /// Takes `&self` rather than consuming the coordinator so callers can hold it behind an
    /// `Arc` and keep calling `enqueue`/`pause` from other tasks while `run` is in flight.
    pub async fn run(&self) -> Result<(), Error> {
        self.store.ping().await?;

        for registration in self.queues.values() {
            let recovered = registration.queue.recover().await?;
            if recovered > 0 {
                event!(Level::INFO, queue = %registration.queue.name(), count = recovered, "Recovered queue on startup");
            }
        }

        let consumer = self.shutdown_consumer().await;

        for registration in self.queues.values() {
            self.control_plane
                .add_queue(
                    registration.queue.clone(),
                    registration.concurrency,
                    self.retry_limit,
                )
                .await;
        }

        let control_handle = crate::control::spawn(self.control_plane.clone(), consumer.clone());

        let mut scheduler = self
            .scheduler
            .lock()
            .await
            .take()
            .expect("run() called more than once");
        let queues_for_status = self
            .queues
            .values()
            .map(|r| r.queue.clone())
            .collect::<Vec<_>>();
        scheduler.add(
            "__status_report",
            Trigger::interval(STATUS_REPORT_INTERVAL),
            Arc::new(StatusReportHandler {
                queues: queues_for_status,
            }),
            Map::new(),
        );
        let scheduler_handle = scheduler.start(consumer.clone());

        let mut shutdown_consumer = consumer;
        shutdown_consumer.wait_for_shutdown().await;

        let _ = control_handle.await;
        let _ = scheduler_handle.await;

        Ok(())
    }
}

struct StatusReportHandler {
    queues: Vec<Arc<Queue>>,
}

#[async_trait::async_trait]
impl Handler for StatusReportHandler {
    async fn call(&self, _kwargs: Map<String, serde_json::Value>) -> Result<(), anyhow::Error> {
        for queue in &self.queues {
            let pending = queue.count().await?;
            let processing = queue.count_processing().await?;
            let status = queue.status().await?;
            event!(
                Level::INFO,
                queue = %queue.name(),
                pending,
                processing,
                status = ?status,
                "Queue status report"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler for CountingHandler {
        async fn call(&self, _kwargs: Map<String, serde_json::Value>) -> Result<(), anyhow::Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn run_drains_an_enqueued_task_then_stops_on_shutdown() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut coordinator = Coordinator::with_store(Arc::new(MemoryStore::new()), 3);
        coordinator
            .register_queue("q", Arc::new(CountingHandler(calls.clone())), 1, None)
            .await;

        let id = coordinator.enqueue("q", Map::new()).await.unwrap();
        assert!(!id.is_empty());

        let coordinator = Arc::new(coordinator);
        let run_handle = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run().await })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while calls.load(Ordering::SeqCst) == 0 {
            if tokio::time::Instant::now() >= deadline {
                panic!("handler never ran");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        coordinator.trigger_shutdown().await;
        run_handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pause_stops_the_pool_immediately_through_the_control_plane() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut coordinator = Coordinator::with_store(Arc::new(MemoryStore::new()), 3);
        coordinator
            .register_queue("q", Arc::new(CountingHandler(calls.clone())), 1, None)
            .await;

        let coordinator = Arc::new(coordinator);
        let run_handle = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run().await })
        };

        // Give the control plane a moment to register the queue and start its pool.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(coordinator
            .pause("q", Duration::from_secs(30))
            .await
            .unwrap());

        coordinator.enqueue("q", Map::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        coordinator.trigger_shutdown().await;
        run_handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn enqueue_to_unregistered_queue_is_function_not_found() {
        let coordinator = Coordinator::with_store(Arc::new(MemoryStore::new()), 3);
        let result = coordinator.enqueue("missing", Map::new()).await;
        assert_matches!(result, Err(Error::FunctionNotFoundError(_)));
    }

    #[tokio::test]
    async fn zero_concurrency_falls_back_to_twice_cpu_count() {
        let mut coordinator = Coordinator::with_store(Arc::new(MemoryStore::new()), 3);
        coordinator
            .register_queue("q", Arc::new(CountingHandler(Arc::new(AtomicUsize::new(0)))), 0, None)
            .await;
        let registered = coordinator.queues.get("q").unwrap().concurrency;
        assert_eq!(registered, (num_cpus::get() * 2) as u32);
    }
}
