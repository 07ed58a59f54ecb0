use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Redis connection error {0}")]
    RedisPoolError(#[from] deadpool::managed::PoolError<redis::RedisError>),

    #[error("Redis pool creation error {0}")]
    RedisPoolCreationError(#[from] deadpool_redis::CreatePoolError),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Could not enqueue task: {0}")]
    EnqueueError(String),

    #[error("Could not dequeue task: {0}")]
    DequeueError(String),

    #[error("Could not requeue task {id}: {source}")]
    RequeueError { id: String, source: String },

    #[error("Could not clear processing entry for task {id}: {source}")]
    ProcessingError { id: String, source: String },

    #[error("No handler registered for queue {0}")]
    FunctionNotFoundError(String),

    #[error("Task {id} timed out after {timeout:?}")]
    Timeout { id: String, timeout: std::time::Duration },

    #[error("Handler for task {id} failed: {source}")]
    HandlerError { id: String, source: anyhow::Error },

    #[error("Invalid cron expression {expression}: {source}")]
    ScheduleParseError {
        expression: String,
        source: cron::error::Error,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    EnvOptionError(#[from] envoption::EnvOptionError),

    #[error(transparent)]
    JoinError(#[from] tokio::task::JoinError),
}
