//! Process-local mapping from queue name to the handler bound to it. Registration is the only
//! way to populate this map; workers only ever read it.

use async_trait::async_trait;
use serde_json::Map;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::Error;

/// A queue's handler, resolved once at registration instead of inspected at dispatch time.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, kwargs: Map<String, serde_json::Value>) -> Result<(), anyhow::Error>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Map<String, serde_json::Value>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), anyhow::Error>> + Send,
{
    async fn call(&self, kwargs: Map<String, serde_json::Value>) -> Result<(), anyhow::Error> {
        (self)(kwargs).await
    }
}

pub struct RegistryEntry {
    pub handler: Arc<dyn Handler>,
    pub concurrency: u32,
    pub timeout: Option<Duration>,
}

#[derive(Default)]
pub struct TaskRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl TaskRegistry {
    pub fn new() -> TaskRegistry {
        TaskRegistry::default()
    }

    /// Bind `handler` to `queue_name`. Intended to be called before the coordinator starts
    /// worker pools; the registry is read-only from a worker's point of view once it's running.
    pub async fn register(
        &self,
        queue_name: &str,
        handler: Arc<dyn Handler>,
        concurrency: u32,
        timeout: Option<Duration>,
    ) {
        let entry = RegistryEntry {
            handler,
            concurrency: concurrency.max(1),
            timeout,
        };
        self.entries
            .write()
            .await
            .insert(queue_name.to_string(), entry);
    }

    pub async fn concurrency(&self, queue_name: &str) -> Result<u32, Error> {
        self.entries
            .read()
            .await
            .get(queue_name)
            .map(|e| e.concurrency)
            .ok_or_else(|| Error::FunctionNotFoundError(queue_name.to_string()))
    }

    pub async fn queue_names(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn dispatch(
        &self,
        queue_name: &str,
        kwargs: Map<String, serde_json::Value>,
    ) -> Result<Result<(), anyhow::Error>, Error> {
        // Hold the read lock only long enough to clone out an owned handle to the handler;
        // the call itself may run for a while (or forever, absent a timeout) and must not
        // block registrations or other dispatches.
        let (handler, timeout) = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(queue_name)
                .ok_or_else(|| Error::FunctionNotFoundError(queue_name.to_string()))?;
            (entry.handler.clone(), entry.timeout)
        };
        let call = handler.call(kwargs);

        match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, call).await {
                Ok(result) => Ok(result),
                Err(_) => Err(Error::Timeout {
                    id: queue_name.to_string(),
                    timeout,
                }),
            },
            None => Ok(call.await),
        }
    }
}
