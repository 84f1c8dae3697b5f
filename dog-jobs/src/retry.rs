//! Retry coordination: turns executor outcomes into record state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::Connection;

use crate::config::RecoveryBehavior;
use crate::job::JobOutcome;
use crate::store::{self, Failure, Rescheduled};
use crate::types::{JobId, JobRecord};
use crate::{time, EngineResult, JobError};

/// Delay between failed executions
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Same delay after every failure
    Fixed(Duration),
    /// `base * 2^(failures - 1)`, capped at `max`. With `jitter` the delay is
    /// drawn uniformly from the upper half of that value.
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    /// Delay after the `failures`-th failed execution
    pub fn delay_for(&self, failures: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { base, max, jitter } => {
                let exponent = failures.saturating_sub(1).min(31);
                let delay = base.saturating_mul(1_u32 << exponent).min(*max);
                if *jitter && !delay.is_zero() {
                    let half = delay / 2;
                    let spread = u64::try_from((delay - half).as_millis()).unwrap_or(u64::MAX);
                    half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
                } else {
                    delay
                }
            }
        }
    }
}

/// Engine-wide handling of failed executions
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    /// Dead-letter a record once it has failed this many times; `None` retries forever
    pub max_failures: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::Fixed(Duration::from_secs(10)),
            max_failures: None,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            backoff: Backoff::Fixed(delay),
            max_failures: None,
        }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            backoff: Backoff::Exponential { base, max, jitter: true },
            max_failures: None,
        }
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = Some(max_failures);
        self
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        self.backoff.delay_for(failures)
    }

    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_failures.is_some_and(|max| failures >= max)
    }
}

/// Final state of a record after one execution
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Settlement {
    Completed,
    Retrying {
        not_before: DateTime<Utc>,
        /// Set when the retry follows a failure rather than `NeedsRetry`
        error: Option<String>,
    },
    Superseded {
        by: JobId,
    },
    DeadLettered {
        error: String,
    },
    Missing,
}

impl Settlement {
    fn from_rescheduled(rescheduled: Rescheduled, error: Option<String>) -> Self {
        match rescheduled {
            Rescheduled::Pending { not_before } => Self::Retrying { not_before, error },
            Rescheduled::Superseded { by } => Self::Superseded { by },
            Rescheduled::Missing => Self::Missing,
        }
    }
}

/// Persist the outcome of an execution that returned normally
pub(crate) fn settle_outcome(
    conn: &Connection,
    record: &JobRecord,
    outcome: JobOutcome,
    now: DateTime<Utc>,
) -> EngineResult<Settlement> {
    match outcome {
        JobOutcome::Success => Ok(if store::complete(conn, record.id)? {
            Settlement::Completed
        } else {
            Settlement::Missing
        }),
        JobOutcome::NeedsRetry(delay) => {
            let not_before = time::after(now, delay);
            let rescheduled = store::reschedule(conn, record.id, not_before, None, now)?;
            Ok(Settlement::from_rescheduled(rescheduled, None))
        }
    }
}

/// Persist a failed execution: back off, or dead-letter once the policy is exhausted
pub(crate) fn settle_failure(
    conn: &Connection,
    record: &JobRecord,
    error: &JobError,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> EngineResult<Settlement> {
    let failures = record.failures.saturating_add(1);
    let message = error.to_string();

    if policy.is_exhausted(failures) {
        return Ok(if store::mark_failed(conn, record.id, failures, &message, now)? {
            Settlement::DeadLettered { error: message }
        } else {
            Settlement::Missing
        });
    }

    let not_before = time::after(now, policy.delay_for(failures));
    let failure = Failure {
        failures,
        error: &message,
    };
    let rescheduled = store::reschedule(conn, record.id, not_before, Some(failure), now)?;
    Ok(Settlement::from_rescheduled(rescheduled, Some(message)))
}

/// Make records orphaned in the running state pending again
pub(crate) fn recover(
    conn: &Connection,
    behavior: RecoveryBehavior,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> EngineResult<Vec<(JobId, Rescheduled)>> {
    let not_before = match behavior {
        RecoveryBehavior::RetryImmediately => now,
        RecoveryBehavior::RetryWithBackoff => time::after(now, policy.delay_for(1)),
    };
    store::running_ids(conn)?
        .into_iter()
        .map(|id| Ok((id, store::reschedule(conn, id, not_before, None, now)?)))
        .collect()
}
