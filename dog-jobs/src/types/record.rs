use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use super::{CorrelationId, JobId, JobPriority, SagaId};

/// Job state lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting for its not-before time and a free executor slot
    Pending,

    /// Claimed by the dispatcher and currently executing
    Running,

    /// Dead-lettered; only an explicit requeue brings it back
    Failed,
}

impl JobState {
    /// Get the state name as stored in the job table
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }

    /// Check if the record can still be picked up by the dispatcher
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl ToSql for JobState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.name()))
    }
}

impl FromSql for JobState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// Job record - durable runtime state kept in the job table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique, monotonically assigned identifier
    pub id: JobId,

    /// Tag of the executor that handles the record
    pub job_type: String,

    /// Opaque payload, meaningful only to the executor
    pub payload: Vec<u8>,

    pub priority: JobPriority,

    /// The record is ineligible for execution before this instant
    pub not_before: DateTime<Utc>,

    pub debounce_key: Option<String>,

    pub saga_id: Option<SagaId>,

    pub correlation_id: CorrelationId,

    pub state: JobState,

    /// How many times the dispatcher claimed the record
    pub attempts: u32,

    /// How many executions ended in an error, panic or timeout
    pub failures: u32,

    /// Last error message (if any)
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Check if the record is ready to run at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state.is_pending() && self.not_before <= now
    }
}
