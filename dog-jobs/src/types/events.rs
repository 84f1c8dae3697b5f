use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CorrelationId, JobId};

/// Minimal stable event protocol for structured observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// Job was enqueued, or coalesced into an existing pending record
    Enqueued {
        job_id: JobId,
        job_type: String,
        correlation_id: CorrelationId,
        coalesced: bool,
        at: DateTime<Utc>,
    },

    /// Job was claimed and handed to its executor
    Started {
        job_id: JobId,
        job_type: String,
        attempt: u32,
        at: DateTime<Utc>,
    },

    /// Job is pending again with a later not-before time
    Retrying {
        job_id: JobId,
        job_type: String,
        not_before: DateTime<Utc>,
        error: Option<String>,
        at: DateTime<Utc>,
    },

    /// Job completed successfully and was removed
    Completed {
        job_id: JobId,
        job_type: String,
        at: DateTime<Utc>,
    },

    /// A retrying record was dropped in favour of a newer pending record with its debounce key
    Superseded {
        job_id: JobId,
        by: JobId,
        at: DateTime<Utc>,
    },

    /// Job was dead-lettered
    Failed {
        job_id: JobId,
        job_type: String,
        error: String,
        at: DateTime<Utc>,
    },

    /// Pending job was canceled by an operator
    Canceled {
        job_id: JobId,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Started { .. } => "started",
            Self::Retrying { .. } => "retrying",
            Self::Completed { .. } => "completed",
            Self::Superseded { .. } => "superseded",
            Self::Failed { .. } => "failed",
            Self::Canceled { .. } => "canceled",
        }
    }

    /// Get the job ID from any event
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Enqueued { job_id, .. }
            | Self::Started { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Superseded { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Canceled { job_id, .. } => *job_id,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Enqueued { at, .. }
            | Self::Started { at, .. }
            | Self::Retrying { at, .. }
            | Self::Completed { at, .. }
            | Self::Superseded { at, .. }
            | Self::Failed { at, .. }
            | Self::Canceled { at, .. } => at,
        }
    }
}
