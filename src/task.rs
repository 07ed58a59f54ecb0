use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::convert::TryFrom;

use crate::error::Error;

/// Only `Pending` is ever serialized into a task's stored bytes. `status` exists purely so the
/// wire schema stays stable; a task's `processing` state is implicit in sidecar residency,
/// never recorded in the JSON itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
}

/// The unit of work carried on a queue. Field order here is the canonical JSON encode order;
/// `mark_complete` depends on two encodes of equal logical content producing identical bytes, so
/// this struct and its `Serialize` impl must never be reordered or given `#[serde(flatten)]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub kwargs: Map<String, serde_json::Value>,
    pub status: TaskStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
}

impl Task {
    pub fn new(name: &str, kwargs: Map<String, serde_json::Value>) -> Task {
        Task {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            kwargs,
            status: TaskStatus::Pending,
            retry_count: 0,
            start_time: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Task, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Stamp the dispatch time, in seconds since the epoch, as the worker picks this task up.
    pub fn mark_started(&mut self) {
        self.start_time = Some(Utc::now().timestamp());
    }

    /// Reset to the on-queue shape: pending, no start time, retry count bumped by the caller
    /// before this is invoked.
    pub fn mark_requeued(&mut self) {
        self.status = TaskStatus::Pending;
        self.start_time = None;
    }
}

impl TryFrom<&[u8]> for Task {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Task::decode(bytes)
    }
}
