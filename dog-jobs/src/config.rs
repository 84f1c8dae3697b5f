//! Engine and writer configuration.
//!
//! Both structs carry sensible defaults and can be overridden from
//! environment variables sharing a prefix, so several stores can be
//! configured side by side:
//!
//! ```bash
//! export DOG_JOBS_DB_PATH=/var/lib/boxes/main.db
//! export DOG_JOBS_AI_DB_PATH=/var/lib/boxes/ai.db
//! export DOG_JOBS_NORMAL_CONCURRENCY=16
//! ```

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::{Backoff, RetryPolicy};
use crate::{EngineError, EngineResult};

/// Configuration for one write serializer
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Name used for the worker thread and in logs ("main", "ai", ...)
    pub name: String,
    /// SQLite database file
    pub path: PathBuf,
    /// Worker idle timeout before the thread and its connection are released
    pub idle_timeout: Duration,
    /// How long SQLite waits on a locked database before failing
    pub busy_timeout: Duration,
}

impl WriterConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            idle_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    /// Load from `<PREFIX>_DB_PATH`, `<PREFIX>_WRITER_IDLE_TIMEOUT_MS` and `<PREFIX>_BUSY_TIMEOUT_MS`
    pub fn from_env(name: impl Into<String>, prefix: &str) -> EngineResult<Self> {
        Self::from_lookup(name, prefix, |key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(name: impl Into<String>, prefix: &str, lookup: F) -> EngineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { prefix, lookup };
        let path = env
            .raw("DB_PATH")
            .ok_or_else(|| EngineError::Config(format!("{prefix}_DB_PATH is not set")))?;
        let mut config = Self::new(name, path);
        if let Some(idle) = env.millis("WRITER_IDLE_TIMEOUT_MS")? {
            config.idle_timeout = idle;
        }
        if let Some(busy) = env.millis("BUSY_TIMEOUT_MS")? {
            config.busy_timeout = busy;
        }
        Ok(config)
    }
}

/// How to treat records already marked as running when the dispatcher starts.
/// This accounts for a process that was stopped mid-job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryBehavior {
    /// Make the record pending again and run it as soon as possible
    #[default]
    RetryImmediately,
    /// Make the record pending again after the first retry backoff
    RetryWithBackoff,
}

/// Configuration for the job engine and its dispatcher
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on how long the dispatcher sleeps without a wake-up
    pub poll_interval: Duration,
    /// Maximum number of ready records examined per dispatch tick
    pub dispatch_batch_size: usize,
    /// Concurrent normal executors
    pub normal_concurrency: usize,
    /// Concurrent long-running executors, sized independently of the normal pool
    pub long_running_concurrency: usize,
    /// Time limit for normal executors
    pub normal_timeout: Option<Duration>,
    /// Time limit for long-running executors
    pub long_running_timeout: Option<Duration>,
    /// Backoff for failed executions
    pub retry: RetryPolicy,
    /// Treatment of records orphaned in the running state
    pub recovery: RecoveryBehavior,
    /// Capacity of the job event broadcast channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            dispatch_batch_size: 32,
            normal_concurrency: 8,
            long_running_concurrency: 2,
            normal_timeout: Some(Duration::from_secs(300)), // 5 minutes
            long_running_timeout: None,
            retry: RetryPolicy::default(),
            recovery: RecoveryBehavior::default(),
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Load overrides of the defaults from `<PREFIX>_*` environment variables
    pub fn from_env(prefix: &str) -> EngineResult<Self> {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(prefix: &str, lookup: F) -> EngineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { prefix, lookup };
        let mut config = Self::default();
        if let Some(poll) = env.millis("POLL_INTERVAL_MS")? {
            config.poll_interval = poll;
        }
        if let Some(batch) = env.parse("BATCH_SIZE")? {
            config.dispatch_batch_size = batch;
        }
        if let Some(normal) = env.parse("NORMAL_CONCURRENCY")? {
            config.normal_concurrency = normal;
        }
        if let Some(long) = env.parse("LONG_RUNNING_CONCURRENCY")? {
            config.long_running_concurrency = long;
        }
        if let Some(timeout) = env.millis("NORMAL_TIMEOUT_MS")? {
            config.normal_timeout = (!timeout.is_zero()).then_some(timeout);
        }
        if let Some(backoff) = env.millis("RETRY_BACKOFF_MS")? {
            config.retry.backoff = Backoff::Fixed(backoff);
        }
        if let Some(max) = env.parse::<u32>("MAX_FAILURES")? {
            config.retry.max_failures = (max > 0).then_some(max);
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the dispatcher cannot make progress with
    pub fn validate(&self) -> EngineResult<()> {
        if self.dispatch_batch_size == 0 {
            return Err(EngineError::Config("dispatch_batch_size must be at least 1".into()));
        }
        if self.normal_concurrency == 0 || self.long_running_concurrency == 0 {
            return Err(EngineError::Config("executor pools need at least one slot".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(EngineError::Config("poll_interval must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(EngineError::Config("event_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

struct EnvReader<'a, F> {
    prefix: &'a str,
    lookup: F,
}

impl<F> EnvReader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn key(&self, suffix: &str) -> String {
        format!("{}_{}", self.prefix, suffix)
    }

    fn raw(&self, suffix: &str) -> Option<String> {
        (self.lookup)(&self.key(suffix))
    }

    fn parse<T>(&self, suffix: &str) -> EngineResult<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.raw(suffix)
            .map(|value| {
                value.trim().parse::<T>().map_err(|e| {
                    EngineError::Config(format!("{}={value:?}: {e}", self.key(suffix)))
                })
            })
            .transpose()
    }

    fn millis(&self, suffix: &str) -> EngineResult<Option<Duration>> {
        Ok(self.parse::<u64>(suffix)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn engine_defaults_apply_without_variables() {
        let config = EngineConfig::from_lookup("DOG_JOBS", lookup(&[])).unwrap();
        assert_eq!(config.normal_concurrency, 8);
        assert_eq!(config.retry.max_failures, None);
        assert_eq!(config.retry.backoff, Backoff::Fixed(Duration::from_secs(10)));
    }

    #[test]
    fn engine_overrides_are_read_with_prefix() {
        let config = EngineConfig::from_lookup(
            "DOG_JOBS",
            lookup(&[
                ("DOG_JOBS_NORMAL_CONCURRENCY", "16"),
                ("DOG_JOBS_RETRY_BACKOFF_MS", "2500"),
                ("DOG_JOBS_MAX_FAILURES", "5"),
                ("DOG_JOBS_NORMAL_TIMEOUT_MS", "0"),
            ]),
        )
        .unwrap();
        assert_eq!(config.normal_concurrency, 16);
        assert_eq!(config.retry.backoff, Backoff::Fixed(Duration::from_millis(2500)));
        assert_eq!(config.retry.max_failures, Some(5));
        assert_eq!(config.normal_timeout, None);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let err = EngineConfig::from_lookup("DOG_JOBS", lookup(&[("DOG_JOBS_BATCH_SIZE", "many")])).unwrap_err();
        assert!(matches!(err, EngineError::Config(msg) if msg.contains("DOG_JOBS_BATCH_SIZE")));

        let err = EngineConfig::from_lookup("DOG_JOBS", lookup(&[("DOG_JOBS_BATCH_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn writer_requires_a_path() {
        assert!(WriterConfig::from_lookup("ai", "DOG_JOBS_AI", lookup(&[])).is_err());

        let config = WriterConfig::from_lookup(
            "ai",
            "DOG_JOBS_AI",
            lookup(&[
                ("DOG_JOBS_AI_DB_PATH", "/tmp/ai.db"),
                ("DOG_JOBS_AI_WRITER_IDLE_TIMEOUT_MS", "750"),
            ]),
        )
        .unwrap();
        assert_eq!(config.name, "ai");
        assert_eq!(config.path, PathBuf::from("/tmp/ai.db"));
        assert_eq!(config.idle_timeout, Duration::from_millis(750));
        assert_eq!(config.busy_timeout, Duration::from_secs(5));
    }
}
