use std::fmt;
use std::ops::Deref;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, field, info_span, Span};

use super::ExecutorRegistry;
use crate::store::{self, EnqueueReceipt};
use crate::types::{CorrelationId, JobId, JobPriority, JobRecord, NewJob, SagaId};
use crate::{EngineError, EngineResult, JobEngine};

/// Job inserted through a [`JobTx`], announced once the transaction commits
#[derive(Debug, Clone)]
pub(crate) struct Enqueued {
    pub receipt: EnqueueReceipt,
    pub job_type: String,
    pub correlation_id: CorrelationId,
}

/// Open write transaction that can schedule jobs.
///
/// Dereferences to the underlying [`Connection`] so business rows can be
/// written next to the job records. Nothing is visible to the dispatcher
/// until the surrounding transaction commits.
pub struct JobTx<'a> {
    conn: &'a Connection,
    registry: &'a ExecutorRegistry,
    now: DateTime<Utc>,
    enqueued: Vec<Enqueued>,
}

impl<'a> JobTx<'a> {
    pub(crate) fn new(conn: &'a Connection, registry: &'a ExecutorRegistry, now: DateTime<Utc>) -> Self {
        Self {
            conn,
            registry,
            now,
            enqueued: Vec::new(),
        }
    }

    /// Schedule `job` in this transaction. With a debounce key the job may
    /// replace a pending record, whose id is returned.
    pub fn enqueue(&mut self, job: NewJob) -> EngineResult<JobId> {
        if !self.registry.is_registered(&job.job_type) {
            return Err(EngineError::JobTypeNotRegistered(job.job_type));
        }
        let receipt = store::enqueue(self.conn, &job, self.now)?;
        debug!(
            job_id = %receipt.id,
            job_type = %job.job_type,
            payload_bytes = job.payload_size(),
            coalesced = receipt.coalesced,
            "job enqueued in transaction"
        );
        self.enqueued.push(Enqueued {
            receipt,
            job_type: job.job_type,
            correlation_id: job.correlation_id,
        });
        Ok(receipt.id)
    }

    /// Schedule several jobs under one correlation id
    pub fn enqueue_bulk<I>(&mut self, jobs: I, correlation_id: &CorrelationId) -> EngineResult<Vec<JobId>>
    where
        I: IntoIterator<Item = NewJob>,
    {
        jobs.into_iter()
            .map(|job| self.enqueue(job.with_correlation_id(correlation_id.clone())))
            .collect()
    }

    /// Time the transaction treats as "now" for delays
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn connection(&self) -> &Connection {
        self.conn
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        self.registry
    }

    pub(crate) fn into_enqueued(self) -> Vec<Enqueued> {
        self.enqueued
    }
}

impl Deref for JobTx<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

/// Per-execution information handed to executors
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: String,
    /// 1 on the first execution
    pub attempt: u32,
    /// Failed executions so far
    pub failures: u32,
    pub priority: JobPriority,
    pub saga_id: Option<SagaId>,
    pub correlation_id: CorrelationId,
    pub debounce_key: Option<String>,
    engine: JobEngine,
}

impl JobContext {
    pub(crate) fn for_record(record: &JobRecord, engine: JobEngine) -> Self {
        Self {
            job_id: record.id,
            job_type: record.job_type.clone(),
            attempt: record.attempts,
            failures: record.failures,
            priority: record.priority,
            saga_id: record.saga_id.clone(),
            correlation_id: record.correlation_id.clone(),
            debounce_key: record.debounce_key.clone(),
            engine,
        }
    }

    /// Engine the job runs on, for follow-up writes from async executors
    pub fn engine(&self) -> &JobEngine {
        &self.engine
    }

    pub(crate) fn span(&self) -> Span {
        let span = info_span!(
            "job",
            job_id = %self.job_id,
            job_type = %self.job_type,
            attempt = self.attempt,
            correlation_id = %self.correlation_id,
            saga_id = field::Empty,
        );
        if let Some(saga_id) = &self.saga_id {
            span.record("saga_id", field::display(saga_id));
        }
        span
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("attempt", &self.attempt)
            .field("failures", &self.failures)
            .field("priority", &self.priority)
            .field("saga_id", &self.saga_id)
            .field("correlation_id", &self.correlation_id)
            .field("debounce_key", &self.debounce_key)
            .finish_non_exhaustive()
    }
}
