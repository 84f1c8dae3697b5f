use std::any::Any;
use std::time::Duration;

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Infrastructure errors raised by the write serializer, the job store and the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("write operation panicked: {0}")]
    Panicked(String),

    #[error("write operation was cancelled before it started")]
    Cancelled,

    #[error("write serializer `{0}` has been shut down")]
    ShutDown(String),

    #[error("write serializer unavailable: {0}")]
    WriterUnavailable(String),

    #[error("no tokio runtime available to drive the write serializer")]
    NoRuntime,

    #[error("Job type not registered: {0}")]
    JobTypeNotRegistered(String),

    #[error("Job type already registered: {0}")]
    JobTypeAlreadyRegistered(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether the serializer refused or abandoned the work because it is going away
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::ShutDown(_) | Self::Cancelled)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Failure of a single job execution.
///
/// Every variant is treated as transient by the dispatcher: the record stays
/// pending and is retried with the engine backoff. Executors that want a job
/// to stop must return `JobOutcome::Success` themselves.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("job failed: {0}")]
    Failed(String),

    #[error("malformed payload for `{job_type}`: {reason}")]
    Payload { job_type: String, reason: String },

    #[error("job exceeded its {0:?} time limit")]
    TimedOut(Duration),

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    /// Create a plain failure
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Malformed payloads are programming errors; they are logged louder than other failures
    pub fn is_payload_error(&self) -> bool {
        matches!(self, Self::Payload { .. })
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
