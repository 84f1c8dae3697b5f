//! # dog-jobs: Durable Background Jobs over SQLite
//!
//! **Single-writer job engine for embedded stores**
//!
//! SQLite admits one writer at a time. dog-jobs routes every write through a
//! per-store [`WriteSerializer`] and keeps its job records in the same
//! database, so jobs enqueued by a business transaction commit or roll back
//! with it.
//!
//! ## Features
//!
//! - **Write Serializer**: FIFO units on a dedicated connection thread, started on demand and stopped when idle
//! - **Durable Jobs**: priority, earliest start time, retry counters and correlation ids survive restarts
//! - **Three Executor Contracts**: transactional (inside the settling transaction), normal and long-running pools
//! - **Retries**: `NeedsRetry` delays are honored; failures back off with a configurable policy
//! - **Debounce**: pending jobs sharing a key collapse into one record
//! - **Sagas**: each step enqueues its successor atomically with its own effects
//! - **After-commit side effects**: cache invalidation runs only once a transaction is durable
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dog_jobs::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Thumbnail {
//!     blob_id: String,
//! }
//!
//! struct RenderThumbnail;
//!
//! impl JobDefinition for RenderThumbnail {
//!     const JOB_TYPE: &'static str = "render_thumbnail";
//!     type Payload = Thumbnail;
//!
//!     fn debounce_key(p: &Thumbnail) -> Option<String> {
//!         Some(format!("thumbnail:{}", p.blob_id))
//!     }
//! }
//!
//! #[async_trait]
//! impl Job for RenderThumbnail {
//!     async fn execute(&self, p: Thumbnail, ctx: &JobContext) -> Result<JobOutcome, JobError> {
//!         render(&p.blob_id).await?;
//!         Ok(JobOutcome::Success)
//!     }
//! }
//!
//! let writer = WriteSerializer::new(WriterConfig::new("main", "app.db"));
//! let mut registry = ExecutorRegistry::new();
//! registry.register(RenderThumbnail)?;
//!
//! let engine = JobEngine::builder(writer).registry(registry).open().await?;
//! let dispatcher = engine.start()?;
//!
//! engine.enqueue(NewJob::of::<RenderThumbnail>(&Thumbnail { blob_id: "b1".into() })?).await?;
//!
//! dispatcher.shutdown().await?;
//! engine.shutdown().await;
//! ```

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod job;
pub mod observability;
pub mod retry;
pub mod saga;
pub mod side_effect;
pub mod store;
pub mod types;
pub mod writer;

mod time;

// Core API exports
pub use config::{EngineConfig, RecoveryBehavior, WriterConfig};
pub use dispatcher::DispatcherHandle;
pub use engine::{JobEngine, JobEngineBuilder};
pub use error::{EngineError, EngineResult, JobError};
pub use job::{
    ExecutorKind, ExecutorRegistry, Job, JobContext, JobDefinition, JobOutcome, JobTx, TransactionalJob,
    TransactionalOutcome,
};
pub use retry::{Backoff, RetryPolicy};
pub use side_effect::{AfterCommit, CacheInvalidator, NoopInvalidator};
pub use store::{EnqueueReceipt, JobFilter, Rescheduled};
pub use types::{CorrelationId, JobEvent, JobId, JobPriority, JobRecord, JobState, NewJob, SagaId};
pub use writer::{WriteHandle, WriteOperation, WriteSerializer, WriterState};

// Observability exports
pub use observability::{init_tracing, LiveMetrics, MetricsSnapshot};

/// Everything needed to define jobs and run an engine
pub mod prelude {
    // Engine and store
    pub use crate::{
        DispatcherHandle, EngineConfig, JobEngine, WriteSerializer, WriterConfig
    };

    // Job definitions
    pub use crate::{
        ExecutorRegistry, Job, JobContext, JobDefinition, JobOutcome, JobTx, TransactionalJob,
        TransactionalOutcome
    };

    // Essential types
    pub use crate::{
        AfterCommit, CorrelationId, EngineError, EngineResult, JobError, JobId, JobPriority, NewJob,
        RetryPolicy, SagaId
    };

    // Essential traits
    pub use async_trait::async_trait;
}
