use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use rusqlite::Connection;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{warn, Instrument, Span};

use crate::error::panic_message;
use crate::{EngineError, EngineResult};

type InlineFn<T> = Box<dyn FnOnce(&mut Connection) -> EngineResult<T> + Send>;
type AwaitedFn<T> =
    Box<dyn for<'c> FnOnce(&'c mut Connection) -> LocalBoxFuture<'c, EngineResult<T>> + Send>;

/// Body of a write operation
pub enum Work<T> {
    /// Runs synchronously on the writer thread
    Inline(InlineFn<T>),
    /// Driven to completion on the writer thread before the next unit starts
    Awaited(AwaitedFn<T>),
}

/// Unit of work submitted to a [`WriteSerializer`](super::WriteSerializer).
///
/// `T` is the result handed back to the submitter, `()` for fire-and-forget
/// units. Each operation is consumed exactly once by the serializer worker.
pub struct WriteOperation<T> {
    work: Work<T>,
    cancel: Option<CancellationToken>,
}

impl<T> WriteOperation<T> {
    pub fn inline<F>(f: F) -> Self
    where
        F: FnOnce(&mut Connection) -> EngineResult<T> + Send + 'static,
    {
        Self {
            work: Work::Inline(Box::new(f)),
            cancel: None,
        }
    }

    pub fn awaited<F>(f: F) -> Self
    where
        F: for<'c> FnOnce(&'c mut Connection) -> LocalBoxFuture<'c, EngineResult<T>> + Send + 'static,
    {
        Self {
            work: Work::Awaited(Box::new(f)),
            cancel: None,
        }
    }

    /// Skip the unit if `token` is cancelled before the worker reaches it.
    /// Once the unit has started the token is no longer consulted.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn is_awaited(&self) -> bool {
        matches!(self.work, Work::Awaited(_))
    }
}

/// Completion handle of a submitted [`WriteOperation`]
#[must_use = "the operation result is only observable through its handle"]
pub struct WriteHandle<T> {
    rx: oneshot::Receiver<EngineResult<T>>,
}

impl<T> Future for WriteHandle<T> {
    type Output = EngineResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(EngineError::Internal("write operation dropped without a result".into()))
            })
        })
    }
}

/// Type-erased queue entry owned by the worker
pub(crate) trait QueuedOperation: Send {
    fn run(self: Box<Self>, conn: &mut Connection);

    fn abort(self: Box<Self>, error: EngineError);
}

pub(crate) struct Queued<T> {
    op: WriteOperation<T>,
    reply: oneshot::Sender<EngineResult<T>>,
    span: Span,
    /// Runtime of the submitter, which drives awaited units
    runtime: Option<Handle>,
}

impl<T: Send + 'static> Queued<T> {
    pub(crate) fn new(op: WriteOperation<T>) -> (Box<dyn QueuedOperation>, WriteHandle<T>) {
        let (reply, rx) = oneshot::channel();
        let runtime = if op.is_awaited() { Handle::try_current().ok() } else { None };
        let queued = Self {
            op,
            reply,
            span: Span::current(),
            runtime,
        };
        (Box::new(queued), WriteHandle { rx })
    }

    fn complete(reply: oneshot::Sender<EngineResult<T>>, result: EngineResult<T>) {
        // A dropped handle is a fire-and-forget unit; its failure would be lost otherwise.
        if let Err(Err(e)) = reply.send(result) {
            warn!(error = %e, "detached write operation failed");
        }
    }
}

impl<T: Send + 'static> QueuedOperation for Queued<T> {
    fn run(self: Box<Self>, conn: &mut Connection) {
        let Queued {
            op,
            reply,
            span,
            runtime,
        } = *self;
        if op.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            Self::complete(reply, Err(EngineError::Cancelled));
            return;
        }

        let result = match op.work {
            Work::Inline(f) => span.in_scope(|| {
                catch_unwind(AssertUnwindSafe(move || f(conn)))
                    .unwrap_or_else(|panic| Err(EngineError::Panicked(panic_message(panic.as_ref()))))
            }),
            Work::Awaited(f) => match runtime {
                None => Err(EngineError::NoRuntime),
                Some(runtime) => match catch_unwind(AssertUnwindSafe(move || f(conn))) {
                    Err(panic) => Err(EngineError::Panicked(panic_message(panic.as_ref()))),
                    Ok(fut) => runtime
                        .block_on(AssertUnwindSafe(fut.instrument(span)).catch_unwind())
                        .unwrap_or_else(|panic| Err(EngineError::Panicked(panic_message(panic.as_ref())))),
                },
            },
        };
        Self::complete(reply, result);
    }

    fn abort(self: Box<Self>, error: EngineError) {
        Self::complete(self.reply, Err(error));
    }
}
