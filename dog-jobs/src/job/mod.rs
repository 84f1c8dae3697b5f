pub mod context;
pub mod registry;

pub use context::{JobContext, JobTx};
pub use registry::{ExecutorKind, ExecutorRegistry};

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::side_effect::AfterCommit;
use crate::{JobError, JobPriority};

/// Compile-time description of a job type
pub trait JobDefinition: Send + Sync + 'static {
    /// Job type identifier for dispatch
    const JOB_TYPE: &'static str;

    /// Job priority
    const PRIORITY: JobPriority = JobPriority::Normal;

    /// Payload stored with the record, JSON encoded
    type Payload: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Pending jobs returning the same key are coalesced into one
    fn debounce_key(_payload: &Self::Payload) -> Option<String> {
        None
    }
}

/// What the dispatcher should do with a record after a successful execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Done; the record is removed
    Success,
    /// Run again no earlier than the given delay; not counted as a failure
    NeedsRetry(Duration),
}

/// Executor that performs external I/O outside the write serializer.
///
/// Registered with [`ExecutorRegistry::register`] it runs in the normal pool,
/// with [`ExecutorRegistry::register_long_running`] in the long-running pool.
/// Any persistence goes through new submissions to the engine.
#[async_trait]
pub trait Job: JobDefinition {
    async fn execute(&self, payload: Self::Payload, ctx: &JobContext) -> Result<JobOutcome, JobError>;
}

/// Result of a transactional executor
#[derive(Debug)]
pub struct TransactionalOutcome {
    pub outcome: JobOutcome,
    /// Runs once the transaction has committed
    pub after_commit: AfterCommit,
}

impl TransactionalOutcome {
    pub fn success() -> Self {
        JobOutcome::Success.into()
    }

    pub fn retry_after(delay: Duration) -> Self {
        JobOutcome::NeedsRetry(delay).into()
    }

    pub fn with_after_commit(mut self, after_commit: AfterCommit) -> Self {
        self.after_commit = after_commit;
        self
    }
}

impl From<JobOutcome> for TransactionalOutcome {
    fn from(outcome: JobOutcome) -> Self {
        Self {
            outcome,
            after_commit: AfterCommit::default(),
        }
    }
}

/// Executor that runs entirely inside a write-serializer transaction.
///
/// Row changes, follow-on jobs enqueued through `tx`, and the outcome of this
/// record all commit together. Returning an error (or panicking) rolls every
/// one of them back.
pub trait TransactionalJob: JobDefinition {
    fn execute(
        &self,
        payload: Self::Payload,
        ctx: &JobContext,
        tx: &mut JobTx<'_>,
    ) -> Result<TransactionalOutcome, JobError>;
}
