use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CorrelationId, JobPriority, SagaId};
use crate::{codec, job::JobDefinition, EngineResult};

/// Scheduling request for a job - immutable submission data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    /// Job type identifier for dispatch
    pub job_type: String,

    /// Serialized job payload (opaque bytes)
    pub payload: Vec<u8>,

    /// Job priority for ordering
    pub priority: JobPriority,

    /// Earliest execution time; `None` means as soon as possible
    pub not_before: Option<DateTime<Utc>>,

    /// Delay applied relative to the enqueue time when `not_before` is unset
    pub delay: Option<Duration>,

    /// Pending records sharing this key are coalesced into one
    pub debounce_key: Option<String>,

    /// Workflow grouping, tracing only
    pub saga_id: Option<SagaId>,

    /// Propagated across a cascading operation
    pub correlation_id: CorrelationId,
}

impl NewJob {
    /// Create a job from a type tag and an already serialized payload
    pub fn new(job_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority: JobPriority::default(),
            not_before: None,
            delay: None,
            debounce_key: None,
            saga_id: None,
            correlation_id: CorrelationId::new(),
        }
    }

    /// Create a job with a JSON encoded payload
    pub fn json<P: Serialize + ?Sized>(job_type: impl Into<String>, payload: &P) -> EngineResult<Self> {
        Ok(Self::new(job_type, codec::encode(payload)?))
    }

    /// Create a job for a typed definition, taking its tag, priority and debounce key
    pub fn of<D: JobDefinition>(payload: &D::Payload) -> EngineResult<Self> {
        let mut job = Self::json(D::JOB_TYPE, payload)?.with_priority(D::PRIORITY);
        job.debounce_key = D::debounce_key(payload);
        Ok(job)
    }

    /// Set the job priority
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Run no earlier than `delay` after the enqueue time
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self.not_before = None;
        self
    }

    /// Run no earlier than `at`
    pub fn with_not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self.delay = None;
        self
    }

    /// Set the debounce key
    pub fn with_debounce_key(mut self, key: impl Into<String>) -> Self {
        self.debounce_key = Some(key.into());
        self
    }

    /// Attach the job to a saga
    pub fn in_saga(mut self, saga_id: SagaId) -> Self {
        self.saga_id = Some(saga_id);
        self
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Resolve the effective not-before time against the enqueue time
    pub fn not_before_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match (self.not_before, self.delay) {
            (Some(at), _) => at,
            (None, Some(delay)) => crate::time::after(now, delay),
            (None, None) => now,
        }
    }

    /// Get the payload size in bytes
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}
