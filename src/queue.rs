//! The reliable queue protocol: enqueue, dequeue-with-sidecar, mark-complete, requeue, and crash
//! recovery, all implemented directly on top of the [`Store`] contract (no server-side scripting
//! — see the atomicity note on [`Queue::dequeue`]).

use std::sync::Arc;
use std::time::Duration;
use tracing::{event, Level};

use crate::error::Error;
use crate::store::Store;
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Running,
    Paused,
}

pub struct Queue {
    store: Arc<dyn Store>,
    name: String,
    pending_key: String,
    processing_key: String,
    status_key: String,
}

impl Queue {
    pub fn new(store: Arc<dyn Store>, name: &str) -> Queue {
        Queue {
            store,
            name: name.to_string(),
            pending_key: name.to_string(),
            processing_key: format!("{}:processing", name),
            status_key: format!("queue_status:{}", name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pending_key(&self) -> &str {
        &self.pending_key
    }

    pub fn processing_key(&self) -> &str {
        &self.processing_key
    }

    pub async fn enqueue(&self, kwargs: serde_json::Map<String, serde_json::Value>) -> Result<String, Error> {
        let task = Task::new(&self.name, kwargs);
        let bytes = task
            .encode()
            .map_err(|e| Error::EnqueueError(e.to_string()))?;
        self.store
            .rpush(&self.pending_key, bytes)
            .await
            .map_err(|e| Error::EnqueueError(e.to_string()))?;
        Ok(task.id)
    }

    /// Blocking left-pop with a bounded timeout; on a hit, the exact popped bytes are mirrored
    /// onto the processing sidecar before being decoded and handed back. The two steps are not
    /// atomic — a crash between them strands the sidecar copy, which `recover` reclaims at
    /// startup.
    pub async fn dequeue(&self, block_timeout: Duration) -> Result<Option<Task>, Error> {
        let bytes = self
            .store
            .blpop(&self.pending_key, block_timeout)
            .await
            .map_err(|e| Error::DequeueError(e.to_string()))?;

        let bytes = match bytes {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        self.store
            .rpush(&self.processing_key, bytes.clone())
            .await
            .map_err(|e| Error::DequeueError(e.to_string()))?;

        let task = Task::decode(&bytes).map_err(|e| Error::DequeueError(e.to_string()))?;
        Ok(Some(task))
    }

    /// Remove the first sidecar entry whose decoded id matches. Idempotent: no match is not an
    /// error, since this is called unconditionally from every executor's finally step.
    pub async fn mark_complete(&self, id: &str) -> Result<(), Error> {
        let entries = self
            .store
            .lrange(&self.processing_key)
            .await
            .map_err(|e| Error::ProcessingError {
                id: id.to_string(),
                source: e.to_string(),
            })?;

        let found = entries.iter().find(|bytes| {
            Task::decode(bytes)
                .map(|task| task.id == id)
                .unwrap_or(false)
        });

        if let Some(bytes) = found {
            self.store
                .lrem(&self.processing_key, bytes)
                .await
                .map_err(|e| Error::ProcessingError {
                    id: id.to_string(),
                    source: e.to_string(),
                })?;
        }

        Ok(())
    }

    /// Set the task back to pending, drop its start time, and push it onto the tail. Does not
    /// touch the sidecar — the caller's finally step (`mark_complete`) does that.
    pub async fn requeue(&self, mut task: Task) -> Result<(), Error> {
        task.mark_requeued();
        let bytes = task.encode().map_err(|e| Error::RequeueError {
            id: task.id.clone(),
            source: e.to_string(),
        })?;
        self.store
            .rpush(&self.pending_key, bytes)
            .await
            .map_err(|e| Error::RequeueError {
                id: task.id.clone(),
                source: e.to_string(),
            })
    }

    /// Restore any sidecar residue to the head of the pending list, preserving original order,
    /// then clear the sidecar. Run once per queue at coordinator startup, and again whenever a
    /// queue is paused.
    pub async fn recover(&self) -> Result<usize, Error> {
        let entries = self
            .store
            .lrange(&self.processing_key)
            .await
            .map_err(|e| Error::ProcessingError {
                id: self.name.clone(),
                source: e.to_string(),
            })?;

        for bytes in entries.iter().rev() {
            self.store
                .lpush(&self.pending_key, bytes.clone())
                .await
                .map_err(|e| Error::ProcessingError {
                    id: self.name.clone(),
                    source: e.to_string(),
                })?;
        }

        self.store
            .delete(&self.processing_key)
            .await
            .map_err(|e| Error::ProcessingError {
                id: self.name.clone(),
                source: e.to_string(),
            })?;

        if !entries.is_empty() {
            event!(Level::INFO, queue = %self.name, count = entries.len(), "Recovered stranded processing entries");
        }

        Ok(entries.len())
    }

    pub async fn count(&self) -> Result<usize, Error> {
        Ok(self.store.llen(&self.pending_key).await?)
    }

    pub async fn count_processing(&self) -> Result<usize, Error> {
        Ok(self.store.llen(&self.processing_key).await?)
    }

    /// Any value other than the literal string "Paused" is treated as Running, including
    /// absence of the key (expired TTL or never set).
    pub async fn status(&self) -> Result<QueueStatus, Error> {
        match self.store.get(&self.status_key).await? {
            Some(ref value) if value == "Paused" => Ok(QueueStatus::Paused),
            _ => Ok(QueueStatus::Running),
        }
    }

    /// Returns `true` if this call actually transitioned the queue to paused, `false` if it was
    /// already paused (idempotent no-op).
    pub async fn pause(&self, duration: Duration) -> Result<bool, Error> {
        if self.status().await? == QueueStatus::Paused {
            return Ok(false);
        }
        self.store
            .set(&self.status_key, "Paused", Some(duration))
            .await?;
        Ok(true)
    }

    /// Drain the sidecar back onto the head of the pending list, in original order. Used both
    /// by explicit `pause` and by the control-plane reconciler when it observes a transition to
    /// Paused.
    pub async fn drain_processing_to_head(&self) -> Result<usize, Error> {
        self.recover().await
    }
}
