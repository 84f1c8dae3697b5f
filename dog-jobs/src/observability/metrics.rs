use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Live counters for the job engine
#[derive(Default)]
pub struct LiveMetrics {
    jobs_enqueued: AtomicU64,
    jobs_coalesced: AtomicU64,
    jobs_started: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_retried: AtomicU64,
    failed_attempts: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    jobs_superseded: AtomicU64,
    jobs_canceled: AtomicU64,

    // Per-job-type metrics
    job_types: Mutex<HashMap<String, JobTypeMetrics>>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_type(&self, job_type: &str, update: impl FnOnce(&mut JobTypeMetrics)) {
        let mut job_types = self.job_types.lock();
        match job_types.get_mut(job_type) {
            Some(metrics) => update(metrics),
            None => update(job_types.entry(job_type.to_string()).or_default()),
        }
    }

    pub fn record_enqueued(&self, job_type: &str, coalesced: bool) {
        if coalesced {
            self.jobs_coalesced.fetch_add(1, Ordering::Relaxed);
            self.with_type(job_type, |m| m.coalesced += 1);
        } else {
            self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
            self.with_type(job_type, |m| m.enqueued += 1);
        }
    }

    pub fn record_started(&self, job_type: &str) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
        self.with_type(job_type, |m| m.started += 1);
    }

    pub fn record_completed(&self, job_type: &str) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.with_type(job_type, |m| m.completed += 1);
    }

    /// Executor asked to run again later
    pub fn record_retried(&self, job_type: &str) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
        self.with_type(job_type, |m| m.retried += 1);
    }

    /// Executor failed, panicked or timed out
    pub fn record_failed_attempt(&self, job_type: &str) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
        self.with_type(job_type, |m| m.failed_attempts += 1);
    }

    pub fn record_dead_lettered(&self, job_type: &str) {
        self.jobs_dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.with_type(job_type, |m| m.dead_lettered += 1);
    }

    pub fn record_superseded(&self, job_type: &str) {
        self.jobs_superseded.fetch_add(1, Ordering::Relaxed);
        self.with_type(job_type, |m| m.superseded += 1);
    }

    pub fn record_canceled(&self, job_type: &str) {
        self.jobs_canceled.fetch_add(1, Ordering::Relaxed);
        self.with_type(job_type, |m| m.canceled += 1);
    }

    // Getters for global metrics
    pub fn jobs_enqueued(&self) -> u64 {
        self.jobs_enqueued.load(Ordering::Relaxed)
    }

    pub fn jobs_coalesced(&self) -> u64 {
        self.jobs_coalesced.load(Ordering::Relaxed)
    }

    pub fn jobs_started(&self) -> u64 {
        self.jobs_started.load(Ordering::Relaxed)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn jobs_retried(&self) -> u64 {
        self.jobs_retried.load(Ordering::Relaxed)
    }

    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts.load(Ordering::Relaxed)
    }

    pub fn jobs_dead_lettered(&self) -> u64 {
        self.jobs_dead_lettered.load(Ordering::Relaxed)
    }

    pub fn jobs_superseded(&self) -> u64 {
        self.jobs_superseded.load(Ordering::Relaxed)
    }

    pub fn jobs_canceled(&self) -> u64 {
        self.jobs_canceled.load(Ordering::Relaxed)
    }

    /// Get metrics for a specific job type
    pub fn job_type_metrics(&self, job_type: &str) -> Option<JobTypeMetrics> {
        self.job_types.lock().get(job_type).cloned()
    }

    /// Collect current snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            global: GlobalMetrics {
                jobs_enqueued: self.jobs_enqueued(),
                jobs_coalesced: self.jobs_coalesced(),
                jobs_started: self.jobs_started(),
                jobs_completed: self.jobs_completed(),
                jobs_retried: self.jobs_retried(),
                failed_attempts: self.failed_attempts(),
                jobs_dead_lettered: self.jobs_dead_lettered(),
                jobs_superseded: self.jobs_superseded(),
                jobs_canceled: self.jobs_canceled(),
            },
            job_types: self.job_types.lock().clone(),
        }
    }
}

impl std::fmt::Debug for LiveMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveMetrics")
            .field("global", &self.snapshot().global)
            .finish_non_exhaustive()
    }
}

/// Metrics for a specific job type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobTypeMetrics {
    pub enqueued: u64,
    pub coalesced: u64,
    pub started: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed_attempts: u64,
    pub dead_lettered: u64,
    pub superseded: u64,
    pub canceled: u64,
}

impl JobTypeMetrics {
    /// Share of executions that completed, as a percentage
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed_attempts;
        if finished == 0 {
            100.0
        } else {
            (self.completed as f64 / finished as f64) * 100.0
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub global: GlobalMetrics,
    pub job_types: HashMap<String, JobTypeMetrics>,
}

/// Engine-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GlobalMetrics {
    pub jobs_enqueued: u64,
    pub jobs_coalesced: u64,
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub failed_attempts: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_superseded: u64,
    pub jobs_canceled: u64,
}

impl GlobalMetrics {
    /// Calculate overall success rate
    pub fn success_rate(&self) -> f64 {
        let finished = self.jobs_completed + self.failed_attempts;
        if finished == 0 {
            100.0
        } else {
            (self.jobs_completed as f64 / finished as f64) * 100.0
        }
    }

    /// Records that left the store for good
    pub fn jobs_removed(&self) -> u64 {
        self.jobs_completed + self.jobs_superseded + self.jobs_canceled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_global_and_per_type_values() {
        let metrics = LiveMetrics::new();

        metrics.record_enqueued("send_email", false);
        metrics.record_enqueued("send_email", true);
        metrics.record_started("send_email");
        metrics.record_failed_attempt("send_email");
        metrics.record_started("send_email");
        metrics.record_completed("send_email");
        metrics.record_enqueued("purge_box", false);

        assert_eq!(metrics.jobs_enqueued(), 2);
        assert_eq!(metrics.jobs_coalesced(), 1);
        assert_eq!(metrics.jobs_started(), 2);

        let email = metrics.job_type_metrics("send_email").unwrap();
        assert_eq!(email.enqueued, 1);
        assert_eq!(email.coalesced, 1);
        assert_eq!(email.success_rate(), 50.0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.job_types.len(), 2);
        assert_eq!(snapshot.global.jobs_removed(), 1);
    }

    #[test]
    fn empty_metrics_report_full_success() {
        let global = GlobalMetrics::default();
        assert_eq!(global.success_rate(), 100.0);
        assert!(LiveMetrics::new().job_type_metrics("unknown").is_none());
    }
}
