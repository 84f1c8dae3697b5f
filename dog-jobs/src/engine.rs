use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use rusqlite::TransactionBehavior;
use tokio::sync::{broadcast, Notify};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::dispatcher::{self, DispatcherHandle};
use crate::job::context::Enqueued;
use crate::job::{ExecutorRegistry, JobTx};
use crate::observability::LiveMetrics;
use crate::retry::Settlement;
use crate::side_effect::{CacheInvalidator, NoopInvalidator};
use crate::store::{self, JobFilter, Rescheduled};
use crate::types::{CorrelationId, JobEvent, JobId, JobRecord, NewJob, SagaId};
use crate::writer::WriteSerializer;
use crate::{time, EngineError, EngineResult};

/// Largest listing returned by the operator queries
const LIST_LIMIT: usize = 1_000;

pub(crate) struct EngineInner {
    pub(crate) writer: WriteSerializer,
    pub(crate) registry: Arc<ExecutorRegistry>,
    pub(crate) config: EngineConfig,
    pub(crate) wake: Notify,
    events: broadcast::Sender<JobEvent>,
    metrics: LiveMetrics,
    invalidator: Arc<dyn CacheInvalidator>,
    dispatcher_running: AtomicBool,
}

/// Durable job engine over one write-serialized SQLite store.
///
/// Clones share the same writer, registry and dispatcher state.
#[derive(Clone)]
pub struct JobEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl std::fmt::Debug for JobEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEngine")
            .field("writer", &self.inner.writer)
            .field("registry", &self.inner.registry)
            .field("dispatcher_running", &self.is_dispatching())
            .finish_non_exhaustive()
    }
}

/// Builder for [`JobEngine`]
pub struct JobEngineBuilder {
    writer: WriteSerializer,
    registry: ExecutorRegistry,
    config: EngineConfig,
    invalidator: Arc<dyn CacheInvalidator>,
}

impl JobEngineBuilder {
    pub fn registry(mut self, registry: ExecutorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn invalidator<C: CacheInvalidator>(mut self, invalidator: C) -> Self {
        self.invalidator = Arc::new(invalidator);
        self
    }

    /// Validate the configuration and install the job table
    pub async fn open(self) -> EngineResult<JobEngine> {
        self.config.validate()?;
        self.writer.execute(|conn| store::install(conn)).await?;

        let (events, _) = broadcast::channel(self.config.event_capacity);
        info!(
            writer = %self.writer.name(),
            job_types = self.registry.len(),
            "job engine opened"
        );
        Ok(JobEngine {
            inner: Arc::new(EngineInner {
                writer: self.writer,
                registry: Arc::new(self.registry),
                config: self.config,
                wake: Notify::new(),
                events,
                metrics: LiveMetrics::new(),
                invalidator: self.invalidator,
                dispatcher_running: AtomicBool::new(false),
            }),
        })
    }
}

impl JobEngine {
    pub fn builder(writer: WriteSerializer) -> JobEngineBuilder {
        JobEngineBuilder {
            writer,
            registry: ExecutorRegistry::new(),
            config: EngineConfig::default(),
            invalidator: Arc::new(NoopInvalidator),
        }
    }

    pub fn writer(&self) -> &WriteSerializer {
        &self.inner.writer
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &LiveMetrics {
        &self.inner.metrics
    }

    pub(crate) fn invalidator(&self) -> &dyn CacheInvalidator {
        self.inner.invalidator.as_ref()
    }

    /// Run `f` in one write transaction. Business rows and jobs enqueued
    /// through the [`JobTx`] commit together; the dispatcher is woken afterwards.
    pub async fn transaction<T, F>(&self, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut JobTx<'_>) -> EngineResult<T> + Send + 'static,
    {
        let registry = Arc::clone(&self.inner.registry);
        let (value, enqueued) = self
            .inner
            .writer
            .execute(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut jobs = JobTx::new(&tx, &registry, time::now());
                let value = f(&mut jobs)?;
                let enqueued = jobs.into_enqueued();
                tx.commit()?;
                Ok((value, enqueued))
            })
            .await?;
        self.announce_enqueued(&enqueued);
        Ok(value)
    }

    /// Schedule a single job in its own transaction
    #[instrument(skip(self, job), fields(job_type = %job.job_type, correlation_id = %job.correlation_id))]
    pub async fn enqueue(&self, job: NewJob) -> EngineResult<JobId> {
        self.transaction(move |tx| tx.enqueue(job)).await
    }

    /// Schedule several jobs in one transaction under one correlation id
    #[instrument(skip(self, jobs), fields(correlation_id = %correlation_id))]
    pub async fn enqueue_bulk(&self, jobs: Vec<NewJob>, correlation_id: CorrelationId) -> EngineResult<Vec<JobId>> {
        self.transaction(move |tx| tx.enqueue_bulk(jobs, &correlation_id)).await
    }

    pub async fn get(&self, id: JobId) -> EngineResult<Option<JobRecord>> {
        self.inner.writer.read(move |conn| store::get(conn, id)).await
    }

    /// Pending records in dispatch order
    pub async fn pending_jobs(&self) -> EngineResult<Vec<JobRecord>> {
        self.list(JobFilter::Pending).await
    }

    /// Dead-lettered records, most recent first
    pub async fn failed_jobs(&self) -> EngineResult<Vec<JobRecord>> {
        self.list(JobFilter::Failed).await
    }

    pub async fn saga_jobs(&self, saga_id: SagaId) -> EngineResult<Vec<JobRecord>> {
        self.list(JobFilter::Saga(saga_id)).await
    }

    pub async fn correlated_jobs(&self, correlation_id: CorrelationId) -> EngineResult<Vec<JobRecord>> {
        self.list(JobFilter::Correlation(correlation_id)).await
    }

    pub async fn count(&self, filter: JobFilter) -> EngineResult<u64> {
        self.inner.writer.read(move |conn| store::count(conn, &filter)).await
    }

    async fn list(&self, filter: JobFilter) -> EngineResult<Vec<JobRecord>> {
        self.inner
            .writer
            .read(move |conn| store::list(conn, &filter, LIST_LIMIT))
            .await
    }

    /// Delete a pending record. Returns `false` if it is not pending.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: JobId) -> EngineResult<bool> {
        let canceled = self.inner.writer.execute(move |conn| store::cancel(conn, id)).await?;
        match canceled {
            Some(job_type) => {
                info!(job_id = %id, job_type = %job_type, "job canceled");
                self.inner.metrics.record_canceled(&job_type);
                self.emit(JobEvent::Canceled { job_id: id, at: time::now() });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Move a dead-lettered record back to pending
    #[instrument(skip(self))]
    pub async fn requeue(&self, id: JobId) -> EngineResult<Rescheduled> {
        let outcome = self
            .inner
            .writer
            .transaction(move |tx| store::requeue(tx, id, time::now()))
            .await?;
        if let Rescheduled::Pending { .. } = outcome {
            info!(job_id = %id, "failed job requeued");
            self.inner.wake.notify_one();
        }
        Ok(outcome)
    }

    /// Subscribe to job events
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Job events as a stream; events missed by a lagging consumer are skipped
    pub fn event_stream(&self) -> BoxStream<'static, JobEvent> {
        Box::pin(BroadcastStream::new(self.subscribe()).filter_map(Result::ok))
    }

    /// Start dispatching. Fails while another dispatcher of this engine is running.
    pub fn start(&self) -> EngineResult<DispatcherHandle> {
        if self
            .inner
            .dispatcher_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::Internal("dispatcher already running".to_string()));
        }
        Ok(dispatcher::spawn(self.clone()))
    }

    pub fn is_dispatching(&self) -> bool {
        self.inner.dispatcher_running.load(Ordering::Acquire)
    }

    pub(crate) fn dispatcher_stopped(&self) {
        self.inner.dispatcher_running.store(false, Ordering::Release);
    }

    /// Shut down the write serializer. Stop the dispatcher first so in-flight
    /// jobs can still settle.
    pub async fn shutdown(&self) {
        if self.is_dispatching() {
            warn!("shutting down the engine while its dispatcher is running");
        }
        self.inner.writer.shutdown().await;
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn announce_enqueued(&self, enqueued: &[Enqueued]) {
        if enqueued.is_empty() {
            return;
        }
        let at = time::now();
        for job in enqueued {
            debug!(
                job_id = %job.receipt.id,
                job_type = %job.job_type,
                coalesced = job.receipt.coalesced,
                "job enqueued"
            );
            self.inner.metrics.record_enqueued(&job.job_type, job.receipt.coalesced);
            self.emit(JobEvent::Enqueued {
                job_id: job.receipt.id,
                job_type: job.job_type.clone(),
                correlation_id: job.correlation_id.clone(),
                coalesced: job.receipt.coalesced,
                at,
            });
        }
        self.inner.wake.notify_one();
    }

    pub(crate) fn announce_started(&self, record: &JobRecord) {
        debug!(attempt = record.attempts, "job started");
        self.inner.metrics.record_started(&record.job_type);
        self.emit(JobEvent::Started {
            job_id: record.id,
            job_type: record.job_type.clone(),
            attempt: record.attempts,
            at: time::now(),
        });
    }

    /// Log, count and publish the settlement of one execution
    pub(crate) fn announce_settlement(&self, record: &JobRecord, settlement: &Settlement) {
        let at = time::now();
        let job_type = record.job_type.as_str();
        match settlement {
            Settlement::Completed => {
                debug!("job completed");
                self.inner.metrics.record_completed(job_type);
                self.emit(JobEvent::Completed {
                    job_id: record.id,
                    job_type: record.job_type.clone(),
                    at,
                });
            }
            Settlement::Retrying { not_before, error } => {
                match error {
                    Some(_) => self.inner.metrics.record_failed_attempt(job_type),
                    None => {
                        debug!(not_before = %not_before, "job asked to retry");
                        self.inner.metrics.record_retried(job_type);
                    }
                }
                self.emit(JobEvent::Retrying {
                    job_id: record.id,
                    job_type: record.job_type.clone(),
                    not_before: *not_before,
                    error: error.clone(),
                    at,
                });
            }
            Settlement::Superseded { by } => {
                info!(superseded_by = %by, "job superseded by a newer debounced record");
                self.inner.metrics.record_superseded(job_type);
                self.emit(JobEvent::Superseded {
                    job_id: record.id,
                    by: *by,
                    at,
                });
            }
            Settlement::DeadLettered { error } => {
                error!(error = %error, failures = record.failures + 1, "job dead-lettered");
                self.inner.metrics.record_dead_lettered(job_type);
                self.emit(JobEvent::Failed {
                    job_id: record.id,
                    job_type: record.job_type.clone(),
                    error: error.clone(),
                    at,
                });
            }
            Settlement::Missing => {
                warn!("job record vanished before it could be settled");
            }
        }
    }
}
