//! Dispatch loop: claims ready records and runs their executors.
//!
//! Each tick scans ready records on a read connection. Only when one of them
//! can be claimed (or must be dead-lettered) does it open a write transaction,
//! so an empty table lets the write serializer go idle. Claims follow
//! priority order, bounded by the free slots of the normal and long-running
//! pools. Transactional executors are queued on the write serializer in claim
//! order and run inside the transaction that settles their record; the others
//! run as tasks and settle through a new submission once they return.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rusqlite::TransactionBehavior;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::panic_message;
use crate::job::context::Enqueued;
use crate::job::registry::{DynJob, DynTransactionalJob, Executor};
use crate::job::{ExecutorKind, ExecutorRegistry, JobContext, JobTx};
use crate::retry::{self, Settlement};
use crate::side_effect::AfterCommit;
use crate::store;
use crate::types::JobRecord;
use crate::writer::{WriteHandle, WriteOperation, WriterState};
use crate::{time, EngineError, EngineResult, JobEngine, JobError};

/// Handle to a running dispatcher
pub struct DispatcherHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Stop claiming records, wait for in-flight executions to settle, and return
    pub async fn shutdown(self) -> EngineResult<()> {
        self.shutdown.cancel();
        self.join
            .await
            .map_err(|e| EngineError::Internal(format!("dispatcher join error: {e}")))
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

pub(crate) fn spawn(engine: JobEngine) -> DispatcherHandle {
    let shutdown = CancellationToken::new();
    let config = engine.config();
    let dispatcher = Dispatcher {
        normal: Arc::new(Semaphore::new(config.normal_concurrency)),
        long_running: Arc::new(Semaphore::new(config.long_running_concurrency)),
        tasks: JoinSet::new(),
        shutdown: shutdown.clone(),
        engine,
    };
    let join = tokio::spawn(dispatcher.run());
    DispatcherHandle { shutdown, join }
}

/// Free slots per pool for one tick
#[derive(Debug, Clone, Copy)]
struct Lanes {
    normal: usize,
    long_running: usize,
}

impl Lanes {
    fn take(&mut self, kind: ExecutorKind) -> bool {
        let slots = match kind {
            ExecutorKind::Transactional => return true,
            ExecutorKind::Normal => &mut self.normal,
            ExecutorKind::LongRunning => &mut self.long_running,
        };
        if *slots == 0 {
            return false;
        }
        *slots -= 1;
        true
    }
}

/// Decision for one ready record
enum Pick<'a> {
    Claim(&'a JobRecord),
    /// No executor is registered for its job type
    Unknown(&'a JobRecord),
}

/// Ready records this tick acts on, in dispatch order
fn pick<'a>(ready: &'a [JobRecord], registry: &ExecutorRegistry, mut lanes: Lanes) -> Vec<Pick<'a>> {
    ready
        .iter()
        .filter_map(|record| match registry.kind_of(&record.job_type) {
            None => Some(Pick::Unknown(record)),
            Some(kind) => lanes.take(kind).then_some(Pick::Claim(record)),
        })
        .collect()
}

/// What one dispatch tick did
#[derive(Default)]
struct Tick {
    claimed: Vec<JobRecord>,
    unknown: Vec<(JobRecord, Settlement)>,
    /// The ready query returned a full batch and something was claimed
    saturated: bool,
    next_due: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
}

enum Wake {
    Shutdown,
    Tick,
    Finished(Result<(), JoinError>),
}

struct Dispatcher {
    engine: JobEngine,
    normal: Arc<Semaphore>,
    long_running: Arc<Semaphore>,
    tasks: JoinSet<()>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    async fn run(mut self) {
        info!(writer = %self.engine.writer().name(), "dispatcher started");
        if let Err(e) = self.recover().await {
            error!(error = %e, "could not recover running jobs");
        }

        loop {
            while let Some(finished) = self.tasks.try_join_next() {
                reap(finished);
            }

            let wait = match self.dispatch_ready().await {
                Ok(tick) => self.wait_time(&tick),
                Err(e) if e.is_shutdown() => {
                    info!("write serializer is shut down, stopping dispatcher");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "dispatch tick failed");
                    self.engine.config().poll_interval
                }
            };

            let wake = tokio::select! {
                _ = self.shutdown.cancelled() => Wake::Shutdown,
                _ = self.engine.inner.wake.notified() => Wake::Tick,
                _ = tokio::time::sleep(wait) => Wake::Tick,
                Some(finished) = self.tasks.join_next(), if !self.tasks.is_empty() => Wake::Finished(finished),
            };
            match wake {
                Wake::Shutdown => break,
                Wake::Tick => {}
                Wake::Finished(finished) => reap(finished),
            }
        }

        if !self.tasks.is_empty() {
            info!(in_flight = self.tasks.len(), "waiting for in-flight jobs to settle");
        }
        while let Some(finished) = self.tasks.join_next().await {
            reap(finished);
        }
        self.engine.dispatcher_stopped();
        info!("dispatcher stopped");
    }

    async fn recover(&self) -> EngineResult<()> {
        let behavior = self.engine.config().recovery;
        let policy = self.engine.config().retry.clone();
        let recovered = self
            .engine
            .writer()
            .transaction(move |tx| retry::recover(tx, behavior, &policy, time::now()))
            .await?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), ?behavior, "recovered jobs left running by a previous process");
        }
        for (job_id, outcome) in recovered {
            debug!(%job_id, ?outcome, "recovered job");
        }
        Ok(())
    }

    async fn dispatch_ready(&mut self) -> EngineResult<Tick> {
        // Scans bypass the writer, so a stopped one has to be noticed here
        if self.engine.writer().state() == WriterState::Stopped {
            return Err(EngineError::ShutDown(self.engine.writer().name().to_string()));
        }
        let lanes = Lanes {
            normal: self.normal.available_permits(),
            long_running: self.long_running.available_permits(),
        };
        let mut exclude: Vec<String> = Vec::new();
        if lanes.normal == 0 {
            exclude.extend(self.engine.registry().tags_of(ExecutorKind::Normal));
        }
        if lanes.long_running == 0 {
            exclude.extend(self.engine.registry().tags_of(ExecutorKind::LongRunning));
        }
        let exclude = Arc::new(exclude);
        let batch = self.engine.config().dispatch_batch_size;

        let registry = Arc::clone(&self.engine.inner.registry);
        let scan = Arc::clone(&exclude);
        let (actionable, next_due) = self
            .engine
            .writer()
            .read(move |conn| {
                let excluded: Vec<&str> = scan.iter().map(String::as_str).collect();
                let ready = store::ready(conn, time::now(), batch, &excluded)?;
                Ok((!pick(&ready, &registry, lanes).is_empty(), store::next_due(conn)?))
            })
            .await?;
        if !actionable {
            return Ok(Tick {
                next_due,
                now: time::now(),
                ..Tick::default()
            });
        }

        // The scan may be stale by now; decide again under the write lock
        let registry = Arc::clone(&self.engine.inner.registry);
        let tick = self
            .engine
            .writer()
            .transaction(move |tx| {
                let now = time::now();
                let excluded: Vec<&str> = exclude.iter().map(String::as_str).collect();
                let ready = store::ready(tx, now, batch, &excluded)?;
                let mut tick = Tick {
                    now,
                    ..Tick::default()
                };

                for picked in pick(&ready, &registry, lanes) {
                    match picked {
                        Pick::Unknown(record) => {
                            let error = format!("no executor registered for job type `{}`", record.job_type);
                            let failures = record.failures.saturating_add(1);
                            let settlement = if store::mark_failed(tx, record.id, failures, &error, now)? {
                                Settlement::DeadLettered { error }
                            } else {
                                Settlement::Missing
                            };
                            tick.unknown.push((record.clone(), settlement));
                        }
                        Pick::Claim(record) => {
                            if let Some(claimed) = store::claim(tx, record.id, now)? {
                                tick.claimed.push(claimed);
                            }
                        }
                    }
                }

                tick.saturated = ready.len() == batch && !tick.claimed.is_empty();
                tick.next_due = store::next_due(tx)?;
                Ok(tick)
            })
            .await?;

        for (record, settlement) in &tick.unknown {
            let span = JobContext::for_record(record, self.engine.clone()).span();
            span.in_scope(|| self.engine.announce_settlement(record, settlement));
        }
        for record in &tick.claimed {
            self.launch(record.clone());
        }
        Ok(tick)
    }

    fn launch(&mut self, record: JobRecord) {
        let Some(executor) = self.engine.registry().get(&record.job_type).cloned() else {
            return;
        };
        let ctx = JobContext::for_record(&record, self.engine.clone());
        let span = ctx.span();
        span.in_scope(|| self.engine.announce_started(&record));

        let engine = self.engine.clone();
        let config = engine.config();
        match executor {
            Executor::Transactional(executor) => {
                // Queued here, not in the task, so the writer runs them in claim order
                let unit = transactional_unit(&engine, executor, record.clone(), ctx);
                let handle = span.in_scope(|| engine.writer().submit(unit));
                self.tasks
                    .spawn(finish_transactional(engine, record, handle).instrument(span));
            }
            Executor::Normal(executor) => {
                let lane = Lane::reserve(&self.normal, config.normal_timeout);
                self.tasks
                    .spawn(run_async(engine, executor, record, ctx, lane).instrument(span));
            }
            Executor::LongRunning(executor) => {
                let lane = Lane::reserve(&self.long_running, config.long_running_timeout);
                self.tasks
                    .spawn(run_async(engine, executor, record, ctx, lane).instrument(span));
            }
        }
    }

    fn wait_time(&self, tick: &Tick) -> Duration {
        let poll = self.engine.config().poll_interval;
        if tick.saturated {
            return Duration::ZERO;
        }
        match tick.next_due {
            // Ready but skipped for lack of a free slot: a finishing task wakes the loop
            Some(due) if due <= tick.now => poll,
            Some(due) => time::until(due, time::now()).min(poll),
            None => poll,
        }
    }
}

fn reap(finished: Result<(), JoinError>) {
    if let Err(e) = finished {
        error!(error = %e, "job task ended abnormally");
    }
}

/// Pool slot for one asynchronous execution
struct Lane {
    slots: Arc<Semaphore>,
    /// Taken by the dispatcher when the tick counted a free slot
    reserved: Option<OwnedSemaphorePermit>,
    timeout: Option<Duration>,
}

impl Lane {
    fn reserve(slots: &Arc<Semaphore>, timeout: Option<Duration>) -> Self {
        Self {
            slots: Arc::clone(slots),
            reserved: Arc::clone(slots).try_acquire_owned().ok(),
            timeout,
        }
    }

    async fn acquire(self) -> Option<OwnedSemaphorePermit> {
        match self.reserved {
            Some(permit) => Some(permit),
            // The semaphores are never closed
            None => self.slots.acquire_owned().await.ok(),
        }
    }
}

fn log_failure(error: &JobError) {
    if error.is_payload_error() {
        error!(error = %error, "job payload could not be decoded");
    } else {
        warn!(error = %error, "job failed");
    }
}

async fn run_async(
    engine: JobEngine,
    executor: Arc<dyn DynJob>,
    record: JobRecord,
    ctx: JobContext,
    lane: Lane,
) {
    let timeout = lane.timeout;
    let result = {
        let _slot = lane.acquire().await;
        let execution = AssertUnwindSafe(executor.run(&record.payload, &ctx)).catch_unwind();
        let finished = match timeout {
            Some(limit) => tokio::time::timeout(limit, execution)
                .await
                .unwrap_or(Ok(Err(JobError::TimedOut(limit)))),
            None => execution.await,
        };
        finished.unwrap_or_else(|panic| Err(JobError::Panicked(panic_message(panic.as_ref()))))
    };

    if let Err(error) = &result {
        log_failure(error);
    }

    let policy = engine.config().retry.clone();
    let settled = record.clone();
    let settlement = engine
        .writer()
        .transaction(move |tx| {
            let now = time::now();
            match result {
                Ok(outcome) => retry::settle_outcome(tx, &settled, outcome, now),
                Err(error) => retry::settle_failure(tx, &settled, &error, &policy, now),
            }
        })
        .await;

    match settlement {
        Ok(settlement) => engine.announce_settlement(&record, &settlement),
        Err(e) => error!(error = %e, "could not settle job; it stays running until the next recovery"),
    }
}

enum TransactionalRun {
    Committed {
        settlement: Settlement,
        enqueued: Vec<Enqueued>,
        after_commit: AfterCommit,
    },
    RolledBack {
        settlement: Settlement,
    },
}

/// Writer unit that runs a transactional executor and settles its record
fn transactional_unit(
    engine: &JobEngine,
    executor: Arc<dyn DynTransactionalJob>,
    record: JobRecord,
    ctx: JobContext,
) -> WriteOperation<TransactionalRun> {
    let registry = Arc::clone(&engine.inner.registry);
    let policy = engine.config().retry.clone();

    WriteOperation::inline(move |conn| {
        let now = time::now();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut jobs = JobTx::new(&tx, &registry, now);
        let result = catch_unwind(AssertUnwindSafe(|| executor.run(&record.payload, &ctx, &mut jobs)))
            .unwrap_or_else(|panic| Err(JobError::Panicked(panic_message(panic.as_ref()))));
        let enqueued = jobs.into_enqueued();

        match result {
            Ok(outcome) => {
                let settlement = retry::settle_outcome(&tx, &record, outcome.outcome, now)?;
                tx.commit()?;
                Ok(TransactionalRun::Committed {
                    settlement,
                    enqueued,
                    after_commit: outcome.after_commit,
                })
            }
            Err(error) => {
                tx.rollback()?;
                log_failure(&error);
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let settlement = retry::settle_failure(&tx, &record, &error, &policy, now)?;
                tx.commit()?;
                Ok(TransactionalRun::RolledBack { settlement })
            }
        }
    })
}

async fn finish_transactional(engine: JobEngine, record: JobRecord, handle: WriteHandle<TransactionalRun>) {
    match handle.await {
        Ok(TransactionalRun::Committed {
            settlement,
            enqueued,
            after_commit,
        }) => {
            engine.announce_enqueued(&enqueued);
            if !after_commit.is_empty() {
                after_commit.run(engine.invalidator()).await;
            }
            engine.announce_settlement(&record, &settlement);
        }
        Ok(TransactionalRun::RolledBack { settlement }) => engine.announce_settlement(&record, &settlement),
        Err(e) => error!(error = %e, "could not settle job; it stays running until the next recovery"),
    }
}
