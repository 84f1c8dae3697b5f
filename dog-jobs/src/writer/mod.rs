//! Single-writer execution queue for an embedded SQLite store.
//!
//! A [`WriteSerializer`] owns the only writer connection to its database. The
//! connection lives on a dedicated thread that is started by the first
//! submission and released again after `idle_timeout` without work. Units run
//! strictly in submission order, whether they are inline closures or awaited
//! futures, and a failing unit only fails its own handle.

mod operation;

pub use operation::{WriteHandle, WriteOperation, Work};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use futures::future::LocalBoxFuture;
use parking_lot::{Condvar, Mutex};
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WriterConfig;
use crate::{EngineError, EngineResult};
use operation::{Queued, QueuedOperation};

type Initializer = Arc<dyn Fn(&Connection) -> EngineResult<()> + Send + Sync>;

/// Lifecycle of the serializer worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// No worker thread and no open connection
    Idle,
    /// Worker thread spawned, connection being opened
    Starting,
    /// Worker owns the connection and is processing or waiting for units
    Running,
    /// Shutdown requested; the unit in flight is finishing
    Stopping,
    /// Terminal; submissions are rejected
    Stopped,
}

struct Inner {
    state: WriterState,
    queue: VecDeque<Box<dyn QueuedOperation>>,
    worker: Option<std::thread::JoinHandle<()>>,
    worker_starts: u64,
}

struct Shared {
    config: WriterConfig,
    inner: Mutex<Inner>,
    wakeup: Condvar,
    shutdown: CancellationToken,
    initializer: Option<Initializer>,
}

enum Next {
    Run(Box<dyn QueuedOperation>),
    Idle,
    Shutdown,
}

/// Handle to a write serializer; clones share the same worker and queue
#[derive(Clone)]
pub struct WriteSerializer {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WriteSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSerializer")
            .field("name", &self.shared.config.name)
            .field("path", &self.shared.config.path)
            .field("state", &self.state())
            .finish()
    }
}

impl WriteSerializer {
    pub fn new(config: WriterConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a serializer that runs `init` on every freshly opened writer connection
    pub fn with_initializer<F>(config: WriterConfig, init: F) -> Self
    where
        F: Fn(&Connection) -> EngineResult<()> + Send + Sync + 'static,
    {
        Self::build(config, Some(Arc::new(init)))
    }

    fn build(config: WriterConfig, initializer: Option<Initializer>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(Inner {
                    state: WriterState::Idle,
                    queue: VecDeque::new(),
                    worker: None,
                    worker_starts: 0,
                }),
                wakeup: Condvar::new(),
                shutdown: CancellationToken::new(),
                initializer,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &WriterConfig {
        &self.shared.config
    }

    pub fn state(&self) -> WriterState {
        self.shared.inner.lock().state
    }

    /// How many times a worker thread has been started
    pub fn worker_starts(&self) -> u64 {
        self.shared.inner.lock().worker_starts
    }

    /// Queue a unit of work and return its completion handle
    pub fn submit<T: Send + 'static>(&self, op: WriteOperation<T>) -> WriteHandle<T> {
        let (queued, handle) = Queued::new(op);
        if let Err((queued, e)) = self.push(queued) {
            queued.abort(e);
        }
        handle
    }

    /// Run `f` on the writer connection
    pub async fn execute<T, F>(&self, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> EngineResult<T> + Send + 'static,
    {
        self.submit(WriteOperation::inline(f)).await
    }

    /// Run an async unit on the writer connection; no other unit starts until it finishes.
    /// The unit is driven by the runtime it was submitted from.
    pub async fn execute_async<T, F>(&self, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut Connection) -> LocalBoxFuture<'c, EngineResult<T>> + Send + 'static,
    {
        self.submit(WriteOperation::awaited(f)).await
    }

    /// Run `f` inside an immediate transaction, committed when it returns `Ok`
    pub async fn transaction<T, F>(&self, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> EngineResult<T> + Send + 'static,
    {
        self.execute(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }

    /// Queue a unit without waiting for it; failures are logged
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce(&mut Connection) -> EngineResult<()> + Send + 'static,
    {
        drop(self.submit(WriteOperation::inline(f)));
    }

    /// Run `f` on a fresh query-only connection, off the writer thread
    pub async fn read<T, F>(&self, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> EngineResult<T> + Send + 'static,
    {
        let path = self.shared.config.path.clone();
        let busy_timeout = self.shared.config.busy_timeout;
        tokio::task::spawn_blocking(move || {
            // Read-write open so WAL files can be created when the worker is idle
            let conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update(None, "query_only", true)?;
            f(&conn)
        })
        .await
        .map_err(|e| match e.try_into_panic() {
            Ok(panic) => EngineError::Panicked(crate::error::panic_message(panic.as_ref())),
            Err(e) => EngineError::Internal(format!("read task failed: {e}")),
        })?
    }

    /// Stop the worker. The unit in flight finishes; every unit still queued
    /// completes with [`EngineError::Cancelled`] and later submissions fail.
    pub async fn shutdown(&self) {
        let worker = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                WriterState::Stopped => return,
                WriterState::Idle => {
                    inner.state = WriterState::Stopped;
                    None
                }
                _ => {
                    inner.state = WriterState::Stopping;
                    inner.worker.take()
                }
            }
        };
        self.shared.shutdown.cancel();
        self.shared.wakeup.notify_all();

        if let Some(worker) = worker {
            if let Err(e) = tokio::task::spawn_blocking(move || worker.join()).await {
                warn!(writer = %self.name(), error = %e, "failed to join write serializer worker");
            }
        }

        let leftover = {
            let mut inner = self.shared.inner.lock();
            inner.state = WriterState::Stopped;
            std::mem::take(&mut inner.queue)
        };
        for op in leftover {
            op.abort(EngineError::Cancelled);
        }
        info!(writer = %self.name(), "write serializer stopped");
    }

    fn push(
        &self,
        op: Box<dyn QueuedOperation>,
    ) -> Result<(), (Box<dyn QueuedOperation>, EngineError)> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            WriterState::Stopping | WriterState::Stopped => {
                return Err((op, EngineError::ShutDown(self.name().to_string())));
            }
            WriterState::Idle => {
                let shared = Arc::clone(&self.shared);
                let spawned = std::thread::Builder::new()
                    .name(format!("dog-jobs-writer-{}", self.name()))
                    .spawn(move || shared.run_worker());
                match spawned {
                    Ok(worker) => {
                        inner.state = WriterState::Starting;
                        inner.worker = Some(worker);
                        inner.worker_starts += 1;
                        debug!(writer = %self.name(), starts = inner.worker_starts, "write serializer worker spawned");
                    }
                    Err(e) => {
                        return Err((op, EngineError::WriterUnavailable(format!("cannot spawn worker: {e}"))));
                    }
                }
            }
            WriterState::Starting | WriterState::Running => {}
        }
        inner.queue.push_back(op);
        self.shared.wakeup.notify_one();
        Ok(())
    }
}

impl Shared {
    fn run_worker(self: Arc<Self>) {
        let name = self.config.name.as_str();
        let mut conn = match self.open() {
            Ok(conn) => conn,
            Err(e) => {
                error!(writer = %name, path = %self.config.path.display(), error = %e, "cannot open writer connection");
                let queued = {
                    let mut inner = self.inner.lock();
                    if inner.state == WriterState::Starting {
                        inner.state = WriterState::Idle;
                    }
                    std::mem::take(&mut inner.queue)
                };
                for op in queued {
                    op.abort(EngineError::WriterUnavailable(e.to_string()));
                }
                return;
            }
        };

        {
            let mut inner = self.inner.lock();
            if inner.state == WriterState::Starting {
                inner.state = WriterState::Running;
            }
        }
        info!(writer = %name, "write serializer worker running");

        loop {
            match self.next_operation() {
                Next::Run(op) => op.run(&mut conn),
                Next::Idle => {
                    debug!(writer = %name, "write serializer worker idle, releasing connection");
                    return;
                }
                Next::Shutdown => break,
            }
        }

        drop(conn);
        let leftover = {
            let mut inner = self.inner.lock();
            inner.state = WriterState::Stopped;
            std::mem::take(&mut inner.queue)
        };
        for op in leftover {
            op.abort(EngineError::Cancelled);
        }
    }

    /// Pop the next unit, or decide to go idle once `idle_timeout` passes with an empty queue.
    /// The idle transition happens under the queue lock so a concurrent submission
    /// either lands before it (and is served) or observes `Idle` (and starts a new worker).
    fn next_operation(&self) -> Next {
        let mut inner = self.inner.lock();
        let deadline = Instant::now() + self.config.idle_timeout;
        let mut timed_out = false;
        loop {
            if self.shutdown.is_cancelled() {
                return Next::Shutdown;
            }
            if let Some(op) = inner.queue.pop_front() {
                return Next::Run(op);
            }
            if timed_out {
                inner.state = WriterState::Idle;
                return Next::Idle;
            }
            timed_out = self.wakeup.wait_until(&mut inner, deadline).timed_out();
        }
    }

    fn open(&self) -> EngineResult<Connection> {
        let conn = Connection::open(&self.config.path)?;
        conn.busy_timeout(self.config.busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            warn!(writer = %self.config.name, journal_mode = %mode, "database is not in WAL mode");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", true)?;
        if let Some(init) = &self.initializer {
            init(&conn)?;
        }
        Ok(conn)
    }
}
