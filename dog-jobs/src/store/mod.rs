//! Durable job records.
//!
//! Every function here runs against a connection (usually an open transaction)
//! owned by the caller. Writes must go through the
//! [`WriteSerializer`](crate::writer::WriteSerializer); the listing functions
//! also work on read-only connections.

mod schema;

pub use schema::install;

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{named_params, params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::time;
use crate::types::{CorrelationId, JobId, JobRecord, NewJob, SagaId};
use crate::EngineResult;

const COLUMNS: &str = "id, job_type, payload, priority, not_before, debounce_key, saga_id, \
                       correlation_id, state, attempts, failures, last_error, created_at, updated_at";

/// Result of an enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    pub id: JobId,
    /// The job replaced an existing pending record with the same debounce key
    pub coalesced: bool,
}

/// Where a record ended up after it was made pending again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rescheduled {
    Pending { not_before: DateTime<Utc> },
    /// A newer pending record with the same debounce key exists; this one was deleted
    Superseded { by: JobId },
    /// The record no longer exists
    Missing,
}

/// Selection for operator listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFilter {
    Pending,
    Running,
    Failed,
    Saga(SagaId),
    Correlation(CorrelationId),
}

impl JobFilter {
    fn condition(&self) -> (&'static str, Option<String>) {
        match self {
            Self::Pending => ("state = 'pending'", None),
            Self::Running => ("state = 'running'", None),
            Self::Failed => ("state = 'failed'", None),
            Self::Saga(saga) => ("saga_id = ?1", Some(saga.to_string())),
            Self::Correlation(id) => ("correlation_id = ?1", Some(id.to_string())),
        }
    }

    fn ordering(&self) -> &'static str {
        match self {
            Self::Pending => "priority DESC, id ASC",
            Self::Failed => "updated_at DESC, id ASC",
            Self::Running | Self::Saga(_) | Self::Correlation(_) => "id ASC",
        }
    }
}

/// Error and counter written when an execution failed
#[derive(Debug, Clone, Copy)]
pub(crate) struct Failure<'a> {
    pub failures: u32,
    pub error: &'a str,
}

/// Insert `job`, or fold it into the pending record sharing its debounce key.
///
/// A coalesced record takes over every scheduling attribute of the new job
/// and starts again with clean failure counters.
pub fn enqueue(conn: &Connection, job: &NewJob, now: DateTime<Utc>) -> EngineResult<EnqueueReceipt> {
    let not_before = time::to_millis(job.not_before_at(now));
    let now_ms = time::to_millis(now);

    if let Some(key) = &job.debounce_key {
        let coalesced: Option<JobId> = conn
            .query_row(
                "UPDATE dog_jobs
                 SET job_type = :job_type, payload = :payload, priority = :priority,
                     not_before = :not_before, saga_id = :saga_id,
                     correlation_id = :correlation_id, attempts = 0, failures = 0,
                     last_error = NULL, updated_at = :now
                 WHERE debounce_key = :key AND state = 'pending'
                 RETURNING id",
                named_params! {
                    ":job_type": job.job_type,
                    ":payload": job.payload,
                    ":priority": job.priority,
                    ":not_before": not_before,
                    ":saga_id": job.saga_id,
                    ":correlation_id": job.correlation_id,
                    ":now": now_ms,
                    ":key": key,
                },
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = coalesced {
            return Ok(EnqueueReceipt { id, coalesced: true });
        }
    }

    conn.execute(
        "INSERT INTO dog_jobs (job_type, payload, priority, not_before, debounce_key, saga_id,
                               correlation_id, state, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?8)",
        params![
            job.job_type,
            job.payload,
            job.priority,
            not_before,
            job.debounce_key,
            job.saga_id,
            job.correlation_id,
            now_ms,
        ],
    )?;
    Ok(EnqueueReceipt {
        id: JobId(conn.last_insert_rowid()),
        coalesced: false,
    })
}

/// Enqueue several jobs that share one correlation id
pub fn enqueue_bulk<I>(
    conn: &Connection,
    jobs: I,
    correlation_id: &CorrelationId,
    now: DateTime<Utc>,
) -> EngineResult<Vec<EnqueueReceipt>>
where
    I: IntoIterator<Item = NewJob>,
{
    jobs.into_iter()
        .map(|job| enqueue(conn, &job.with_correlation_id(correlation_id.clone()), now))
        .collect()
}

pub fn get(conn: &Connection, id: JobId) -> EngineResult<Option<JobRecord>> {
    let sql = format!("SELECT {COLUMNS} FROM dog_jobs WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], read_record).optional()?)
}

pub fn list(conn: &Connection, filter: &JobFilter, limit: usize) -> EngineResult<Vec<JobRecord>> {
    let (condition, arg) = filter.condition();
    let ordering = filter.ordering();
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM dog_jobs WHERE {condition} ORDER BY {ordering} LIMIT ?2"
    ))?;
    let rows = match arg {
        // `?1` is unused by the state filters; binding NULL keeps one statement shape
        Some(arg) => stmt.query_map(params![arg, limit], read_record)?,
        None => stmt.query_map(params![Option::<String>::None, limit], read_record)?,
    };
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn count(conn: &Connection, filter: &JobFilter) -> EngineResult<u64> {
    let (condition, arg) = filter.condition();
    let sql = format!("SELECT COUNT(*) FROM dog_jobs WHERE {condition}");
    let count: i64 = match arg {
        Some(arg) => conn.query_row(&sql, [arg], |row| row.get(0))?,
        None => conn.query_row(&sql, [], |row| row.get(0))?,
    };
    Ok(u64::try_from(count).unwrap_or_default())
}

/// Ready records in dispatch order: priority first, then id.
/// Records whose type is in `exclude` are skipped.
pub(crate) fn ready(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: usize,
    exclude: &[&str],
) -> EngineResult<Vec<JobRecord>> {
    let mut sql = format!("SELECT {COLUMNS} FROM dog_jobs WHERE state = 'pending' AND not_before <= ?1");
    if !exclude.is_empty() {
        let placeholders: Vec<String> = (0..exclude.len()).map(|i| format!("?{}", i + 3)).collect();
        sql.push_str(&format!(" AND job_type NOT IN ({})", placeholders.join(", ")));
    }
    sql.push_str(" ORDER BY priority DESC, id ASC LIMIT ?2");

    let mut values = vec![
        Value::Integer(time::to_millis(now)),
        Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)),
    ];
    values.extend(exclude.iter().map(|tag| Value::Text((*tag).to_string())));

    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), read_record)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Earliest not-before among pending records
pub(crate) fn next_due(conn: &Connection) -> EngineResult<Option<DateTime<Utc>>> {
    let millis: Option<i64> = conn.query_row(
        "SELECT MIN(not_before) FROM dog_jobs WHERE state = 'pending'",
        [],
        |row| row.get(0),
    )?;
    Ok(millis.and_then(time::from_millis))
}

/// Mark a pending record as running and count the attempt
pub(crate) fn claim(conn: &Connection, id: JobId, now: DateTime<Utc>) -> EngineResult<Option<JobRecord>> {
    let sql = format!(
        "UPDATE dog_jobs SET state = 'running', attempts = attempts + 1, updated_at = ?2
         WHERE id = ?1 AND state = 'pending'
         RETURNING {COLUMNS}"
    );
    Ok(conn
        .query_row(&sql, params![id, time::to_millis(now)], read_record)
        .optional()?)
}

/// Remove a finished record
pub(crate) fn complete(conn: &Connection, id: JobId) -> EngineResult<bool> {
    Ok(conn.execute("DELETE FROM dog_jobs WHERE id = ?1", [id])? > 0)
}

/// Make a record pending again at `not_before`.
///
/// If another pending record holds the same debounce key, the newer record
/// wins and this one is deleted.
pub(crate) fn reschedule(
    conn: &Connection,
    id: JobId,
    not_before: DateTime<Utc>,
    failure: Option<Failure<'_>>,
    now: DateTime<Utc>,
) -> EngineResult<Rescheduled> {
    let key: Option<Option<String>> = conn
        .query_row("SELECT debounce_key FROM dog_jobs WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    let Some(key) = key else {
        return Ok(Rescheduled::Missing);
    };

    if let Some(key) = key {
        let sibling: Option<JobId> = conn
            .query_row(
                "SELECT id FROM dog_jobs
                 WHERE debounce_key = ?1 AND state = 'pending' AND id <> ?2",
                params![key, id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(by) = sibling {
            conn.execute("DELETE FROM dog_jobs WHERE id = ?1", [id])?;
            return Ok(Rescheduled::Superseded { by });
        }
    }

    match failure {
        Some(failure) => conn.execute(
            "UPDATE dog_jobs
             SET state = 'pending', not_before = ?2, failures = ?3, last_error = ?4, updated_at = ?5
             WHERE id = ?1",
            params![id, time::to_millis(not_before), failure.failures, failure.error, time::to_millis(now)],
        )?,
        None => conn.execute(
            "UPDATE dog_jobs SET state = 'pending', not_before = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, time::to_millis(not_before), time::to_millis(now)],
        )?,
    };
    Ok(Rescheduled::Pending { not_before })
}

/// Dead-letter a record
pub(crate) fn mark_failed(
    conn: &Connection,
    id: JobId,
    failures: u32,
    error: &str,
    now: DateTime<Utc>,
) -> EngineResult<bool> {
    let updated = conn.execute(
        "UPDATE dog_jobs SET state = 'failed', failures = ?2, last_error = ?3, updated_at = ?4
         WHERE id = ?1",
        params![id, failures, error, time::to_millis(now)],
    )?;
    Ok(updated > 0)
}

/// Ids of records left running, typically by a process that stopped mid-job
pub(crate) fn running_ids(conn: &Connection) -> EngineResult<Vec<JobId>> {
    let mut stmt = conn.prepare("SELECT id FROM dog_jobs WHERE state = 'running' ORDER BY id ASC")?;
    let ids = stmt.query_map([], |row| row.get(0))?;
    Ok(ids.collect::<Result<Vec<_>, _>>()?)
}

/// Delete a pending record, returning its job type
pub(crate) fn cancel(conn: &Connection, id: JobId) -> EngineResult<Option<String>> {
    Ok(conn
        .query_row(
            "DELETE FROM dog_jobs WHERE id = ?1 AND state = 'pending' RETURNING job_type",
            [id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Move a failed record back to pending, runnable at `now`
pub(crate) fn requeue(conn: &Connection, id: JobId, now: DateTime<Utc>) -> EngineResult<Rescheduled> {
    let state: Option<String> = conn
        .query_row("SELECT state FROM dog_jobs WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    if state.as_deref() != Some("failed") {
        return Ok(Rescheduled::Missing);
    }
    let outcome = reschedule(conn, id, now, None, now)?;
    if matches!(outcome, Rescheduled::Pending { .. }) {
        conn.execute(
            "UPDATE dog_jobs SET attempts = 0, failures = 0, last_error = NULL WHERE id = ?1",
            [id],
        )?;
    }
    Ok(outcome)
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        id: row.get("id")?,
        job_type: row.get("job_type")?,
        payload: row.get("payload")?,
        priority: row.get("priority")?,
        not_before: timestamp(row, "not_before")?,
        debounce_key: row.get("debounce_key")?,
        saga_id: row.get("saga_id")?,
        correlation_id: row.get("correlation_id")?,
        state: row.get("state")?,
        attempts: row.get("attempts")?,
        failures: row.get("failures")?,
        last_error: row.get("last_error")?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
    })
}

fn timestamp(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(column)?;
    time::from_millis(millis).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            Type::Integer,
            format!("{column} out of range: {millis}").into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobPriority, JobState};
    use std::time::Duration;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        install(&conn).unwrap();
        conn
    }

    #[test]
    fn debounced_enqueue_keeps_one_pending_record_with_latest_payload() {
        let conn = open();
        let now = time::now();

        let first = enqueue(
            &conn,
            &NewJob::new("reindex_box", b"v1".to_vec()).with_debounce_key("box:7"),
            now,
        )
        .unwrap();
        let second = enqueue(
            &conn,
            &NewJob::new("reindex_box", b"v2".to_vec())
                .with_debounce_key("box:7")
                .with_priority(JobPriority::High)
                .with_delay(Duration::from_secs(30)),
            now,
        )
        .unwrap();

        assert!(!first.coalesced);
        assert!(second.coalesced);
        assert_eq!(first.id, second.id);
        assert_eq!(count(&conn, &JobFilter::Pending).unwrap(), 1);

        let record = get(&conn, first.id).unwrap().unwrap();
        assert_eq!(record.payload, b"v2");
        assert_eq!(record.priority, JobPriority::High);
        assert_eq!(record.not_before, time::after(now, Duration::from_secs(30)));
    }

    #[test]
    fn duplicate_pending_debounce_keys_are_rejected_by_the_index() {
        let conn = open();
        let now = time::to_millis(time::now());
        let insert = |conn: &Connection| {
            conn.execute(
                "INSERT INTO dog_jobs (job_type, payload, priority, not_before, debounce_key,
                                       correlation_id, created_at, updated_at)
                 VALUES ('t', x'', 2, ?1, 'k', ?2, ?1, ?1)",
                params![now, CorrelationId::new()],
            )
        };
        insert(&conn).unwrap();
        assert!(insert(&conn).is_err());
    }

    #[test]
    fn ready_orders_by_priority_then_id_and_skips_future_records() {
        let conn = open();
        let now = time::now();
        let low = enqueue(&conn, &NewJob::new("t", vec![]).with_priority(JobPriority::Low), now).unwrap();
        let normal = enqueue(&conn, &NewJob::new("t", vec![]), now).unwrap();
        let critical = enqueue(&conn, &NewJob::new("t", vec![]).with_priority(JobPriority::Critical), now).unwrap();
        let normal_2 = enqueue(&conn, &NewJob::new("t", vec![]), now).unwrap();
        enqueue(
            &conn,
            &NewJob::new("t", vec![])
                .with_priority(JobPriority::Critical)
                .with_delay(Duration::from_secs(60)),
            now,
        )
        .unwrap();

        let ids: Vec<_> = ready(&conn, now, 10, &[]).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![critical.id, normal.id, normal_2.id, low.id]);
        assert_eq!(next_due(&conn).unwrap(), Some(now));
    }

    #[test]
    fn claim_counts_attempts_and_only_takes_pending_records() {
        let conn = open();
        let now = time::now();
        let receipt = enqueue(&conn, &NewJob::new("t", vec![]), now).unwrap();

        let record = claim(&conn, receipt.id, now).unwrap().unwrap();
        assert_eq!(record.state, JobState::Running);
        assert_eq!(record.attempts, 1);
        assert!(claim(&conn, receipt.id, now).unwrap().is_none());
    }

    #[test]
    fn rescheduling_a_running_record_yields_to_a_newer_pending_sibling() {
        let conn = open();
        let now = time::now();
        let old = enqueue(&conn, &NewJob::new("sync", b"old".to_vec()).with_debounce_key("k"), now).unwrap();
        claim(&conn, old.id, now).unwrap();

        let newer = enqueue(&conn, &NewJob::new("sync", b"new".to_vec()).with_debounce_key("k"), now).unwrap();
        assert!(!newer.coalesced);

        let outcome = reschedule(&conn, old.id, time::after(now, Duration::from_secs(5)), None, now).unwrap();
        assert_eq!(outcome, Rescheduled::Superseded { by: newer.id });
        assert!(get(&conn, old.id).unwrap().is_none());
        assert_eq!(get(&conn, newer.id).unwrap().unwrap().payload, b"new");
    }

    #[test]
    fn failures_are_recorded_and_dead_letters_can_be_requeued() {
        let conn = open();
        let now = time::now();
        let receipt = enqueue(&conn, &NewJob::new("t", vec![]), now).unwrap();
        claim(&conn, receipt.id, now).unwrap();

        let later = time::after(now, Duration::from_secs(10));
        reschedule(&conn, receipt.id, later, Some(Failure { failures: 1, error: "smtp down" }), now).unwrap();
        let record = get(&conn, receipt.id).unwrap().unwrap();
        assert_eq!(record.failures, 1);
        assert_eq!(record.last_error.as_deref(), Some("smtp down"));
        assert!(!record.is_ready(now));

        assert!(mark_failed(&conn, receipt.id, 2, "smtp still down", now).unwrap());
        assert_eq!(list(&conn, &JobFilter::Failed, 10).unwrap().len(), 1);
        assert_eq!(cancel(&conn, receipt.id).unwrap(), None);

        let outcome = requeue(&conn, receipt.id, now).unwrap();
        assert_eq!(outcome, Rescheduled::Pending { not_before: now });
        let record = get(&conn, receipt.id).unwrap().unwrap();
        assert_eq!(record.state, JobState::Pending);
        assert_eq!(record.failures, 0);
        assert_eq!(record.last_error, None);
        assert_eq!(cancel(&conn, receipt.id).unwrap().as_deref(), Some("t"));
    }

    #[test]
    fn listings_are_ordered_and_counts_match_their_filter() {
        let conn = open();
        let now = time::now();
        let saga = SagaId::new();
        let low = enqueue(&conn, &NewJob::new("t", vec![]).with_priority(JobPriority::Low).in_saga(saga.clone()), now)
            .unwrap();
        let critical = enqueue(&conn, &NewJob::new("t", vec![]).with_priority(JobPriority::Critical), now).unwrap();
        let normal = enqueue(&conn, &NewJob::new("t", vec![]).in_saga(saga.clone()), now).unwrap();

        let pending: Vec<_> = list(&conn, &JobFilter::Pending, 10).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(pending, vec![critical.id, normal.id, low.id]);
        assert_eq!(count(&conn, &JobFilter::Pending).unwrap(), 3);

        let in_saga: Vec<_> = list(&conn, &JobFilter::Saga(saga.clone()), 10).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(in_saga, vec![low.id, normal.id]);
        assert_eq!(count(&conn, &JobFilter::Saga(saga)).unwrap(), 2);
        assert_eq!(list(&conn, &JobFilter::Pending, 1).unwrap().len(), 1);
    }

    #[test]
    fn bulk_enqueue_shares_the_correlation_id() {
        let conn = open();
        let correlation = CorrelationId::new();
        let receipts = enqueue_bulk(
            &conn,
            vec![NewJob::new("a", vec![]), NewJob::new("b", vec![]), NewJob::new("c", vec![])],
            &correlation,
            time::now(),
        )
        .unwrap();
        assert_eq!(receipts.len(), 3);

        let records = list(&conn, &JobFilter::Correlation(correlation), 10).unwrap();
        let types: Vec<_> = records.iter().map(|r| r.job_type.as_str()).collect();
        assert_eq!(types, vec!["a", "b", "c"]);
        assert_eq!(count(&conn, &JobFilter::Running).unwrap(), 0);
    }
}
