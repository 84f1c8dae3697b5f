//! Post-commit side effects of transactional executors.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error};

use crate::error::panic_message;

/// Cache collaborator told which keys a committed job made stale
#[async_trait]
pub trait CacheInvalidator: Send + Sync + 'static {
    async fn invalidate(&self, keys: &[String]);
}

/// Invalidator for deployments without a cache
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInvalidator;

#[async_trait]
impl CacheInvalidator for NoopInvalidator {
    async fn invalidate(&self, _keys: &[String]) {}
}

/// Work deferred until the transaction of a transactional executor commits.
///
/// Runs outside the write serializer. Panics are caught and logged; they
/// cannot affect the already committed record.
#[derive(Default)]
#[must_use]
pub struct AfterCommit {
    invalidate: Vec<String>,
    actions: Vec<BoxFuture<'static, ()>>,
}

impl AfterCommit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate `key` through the engine's [`CacheInvalidator`]
    pub fn invalidate(mut self, key: impl Into<String>) -> Self {
        self.invalidate.push(key.into());
        self
    }

    /// Run `action` after commit
    pub fn then<F>(mut self, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.actions.push(action.boxed());
        self
    }

    pub fn merge(mut self, other: AfterCommit) -> Self {
        self.invalidate.extend(other.invalidate);
        self.actions.extend(other.actions);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.invalidate.is_empty() && self.actions.is_empty()
    }

    pub fn invalidated_keys(&self) -> &[String] {
        &self.invalidate
    }

    pub(crate) async fn run(self, invalidator: &dyn CacheInvalidator) {
        if !self.invalidate.is_empty() {
            debug!(keys = ?self.invalidate, "invalidating cache keys");
            if let Err(panic) = AssertUnwindSafe(invalidator.invalidate(&self.invalidate))
                .catch_unwind()
                .await
            {
                error!(panic = %panic_message(panic.as_ref()), "cache invalidation panicked");
            }
        }
        for action in self.actions {
            if let Err(panic) = AssertUnwindSafe(action).catch_unwind().await {
                error!(panic = %panic_message(panic.as_ref()), "post-commit action panicked");
            }
        }
    }
}

impl fmt::Debug for AfterCommit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AfterCommit")
            .field("invalidate", &self.invalidate)
            .field("actions", &self.actions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        keys: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CacheInvalidator for Recorder {
        async fn invalidate(&self, keys: &[String]) {
            self.keys.lock().extend_from_slice(keys);
        }
    }

    #[tokio::test]
    async fn invalidations_and_actions_run_even_after_a_panicking_action() {
        let recorder = Recorder::default();
        let ran = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&ran);
        let last = Arc::clone(&ran);
        let effects = AfterCommit::new()
            .invalidate("workspace:1")
            .then(async move { first.lock().push("first") })
            .merge(
                AfterCommit::new()
                    .invalidate("box:9")
                    .then(async { panic!("cache offline") })
                    .then(async move { last.lock().push("last") }),
            );
        assert!(!effects.is_empty());
        assert_eq!(effects.invalidated_keys(), ["workspace:1", "box:9"]);

        effects.run(&recorder).await;

        assert_eq!(*recorder.keys.lock(), vec!["workspace:1".to_string(), "box:9".to_string()]);
        assert_eq!(*ran.lock(), vec!["first", "last"]);
    }
}
