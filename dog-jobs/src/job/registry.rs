use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{Job, JobContext, JobOutcome, JobTx, TransactionalJob, TransactionalOutcome};
use crate::{codec, EngineError, EngineResult, JobError};

/// Contract a job type was registered with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorKind {
    /// Runs inline on the write serializer, inside the transaction that settles the record
    Transactional,
    /// Runs in the normal pool
    Normal,
    /// Runs in the long-running pool
    LongRunning,
}

impl ExecutorKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Transactional => "transactional",
            Self::Normal => "normal",
            Self::LongRunning => "long_running",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Type-erased asynchronous executor
#[async_trait]
pub(crate) trait DynJob: Send + Sync {
    async fn run(&self, payload: &[u8], ctx: &JobContext) -> Result<JobOutcome, JobError>;
}

/// Type-erased transactional executor
pub(crate) trait DynTransactionalJob: Send + Sync {
    fn run(
        &self,
        payload: &[u8],
        ctx: &JobContext,
        tx: &mut JobTx<'_>,
    ) -> Result<TransactionalOutcome, JobError>;
}

struct AsyncAdapter<J>(J);

#[async_trait]
impl<J: Job> DynJob for AsyncAdapter<J> {
    async fn run(&self, payload: &[u8], ctx: &JobContext) -> Result<JobOutcome, JobError> {
        let payload = codec::decode::<J::Payload>(J::JOB_TYPE, payload)?;
        self.0.execute(payload, ctx).await
    }
}

struct TransactionalAdapter<J>(J);

impl<J: TransactionalJob> DynTransactionalJob for TransactionalAdapter<J> {
    fn run(
        &self,
        payload: &[u8],
        ctx: &JobContext,
        tx: &mut JobTx<'_>,
    ) -> Result<TransactionalOutcome, JobError> {
        let payload = codec::decode::<J::Payload>(J::JOB_TYPE, payload)?;
        self.0.execute(payload, ctx, tx)
    }
}

#[derive(Clone)]
pub(crate) enum Executor {
    Transactional(Arc<dyn DynTransactionalJob>),
    Normal(Arc<dyn DynJob>),
    LongRunning(Arc<dyn DynJob>),
}

impl Executor {
    pub(crate) fn kind(&self) -> ExecutorKind {
        match self {
            Self::Transactional(_) => ExecutorKind::Transactional,
            Self::Normal(_) => ExecutorKind::Normal,
            Self::LongRunning(_) => ExecutorKind::LongRunning,
        }
    }
}

/// Maps each job type tag to exactly one executor
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Executor>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an asynchronous executor in the normal pool
    pub fn register<J: Job>(&mut self, job: J) -> EngineResult<()> {
        self.insert(J::JOB_TYPE, Executor::Normal(Arc::new(AsyncAdapter(job))))
    }

    /// Register an asynchronous executor in the long-running pool
    pub fn register_long_running<J: Job>(&mut self, job: J) -> EngineResult<()> {
        self.insert(J::JOB_TYPE, Executor::LongRunning(Arc::new(AsyncAdapter(job))))
    }

    /// Register an executor that runs inside a write-serializer transaction
    pub fn register_transactional<J: TransactionalJob>(&mut self, job: J) -> EngineResult<()> {
        self.insert(J::JOB_TYPE, Executor::Transactional(Arc::new(TransactionalAdapter(job))))
    }

    fn insert(&mut self, job_type: &str, executor: Executor) -> EngineResult<()> {
        if self.executors.contains_key(job_type) {
            return Err(EngineError::JobTypeAlreadyRegistered(job_type.to_string()));
        }
        info!(job_type, kind = %executor.kind(), "registered job type");
        self.executors.insert(job_type.to_string(), executor);
        Ok(())
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<&Executor> {
        self.executors.get(job_type)
    }

    pub fn kind_of(&self, job_type: &str) -> Option<ExecutorKind> {
        self.get(job_type).map(Executor::kind)
    }

    /// Tags registered with one contract
    pub fn tags_of(&self, kind: ExecutorKind) -> Vec<String> {
        self.executors
            .iter()
            .filter(|(_, executor)| executor.kind() == kind)
            .map(|(tag, _)| tag.clone())
            .collect()
    }

    /// Check if a job type is registered
    pub fn is_registered(&self, job_type: &str) -> bool {
        self.executors.contains_key(job_type)
    }

    /// Get all registered job types, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.executors.iter().map(|(tag, executor)| (tag, executor.kind())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobDefinition;
    use serde::{Deserialize, Serialize};
    use tracing_test::traced_test;

    #[derive(Serialize, Deserialize)]
    struct Email {
        to: String,
    }

    struct SendEmail;

    impl JobDefinition for SendEmail {
        const JOB_TYPE: &'static str = "send_email";
        type Payload = Email;
    }

    #[async_trait]
    impl Job for SendEmail {
        async fn execute(&self, _payload: Email, _ctx: &JobContext) -> Result<JobOutcome, JobError> {
            Ok(JobOutcome::Success)
        }
    }

    struct RecordUsage;

    impl JobDefinition for RecordUsage {
        const JOB_TYPE: &'static str = "record_usage";
        type Payload = ();
    }

    impl TransactionalJob for RecordUsage {
        fn execute(
            &self,
            _payload: (),
            _ctx: &JobContext,
            _tx: &mut JobTx<'_>,
        ) -> Result<TransactionalOutcome, JobError> {
            Ok(TransactionalOutcome::success())
        }
    }

    #[test]
    #[traced_test]
    fn each_tag_resolves_to_exactly_one_contract() {
        let mut registry = ExecutorRegistry::new();
        registry.register(SendEmail).unwrap();
        registry.register_transactional(RecordUsage).unwrap();

        assert_eq!(registry.kind_of("send_email"), Some(ExecutorKind::Normal));
        assert_eq!(registry.kind_of("record_usage"), Some(ExecutorKind::Transactional));
        assert_eq!(registry.kind_of("unknown"), None);
        assert_eq!(registry.registered_types(), vec!["record_usage", "send_email"]);
        assert_eq!(registry.tags_of(ExecutorKind::Normal), vec!["send_email"]);
        assert!(registry.tags_of(ExecutorKind::LongRunning).is_empty());

        let err = registry.register_long_running(SendEmail).unwrap_err();
        assert!(matches!(err, EngineError::JobTypeAlreadyRegistered(tag) if tag == "send_email"));
        assert_eq!(registry.kind_of("send_email"), Some(ExecutorKind::Normal));
        assert!(logs_contain("registered job type"));
    }
}
