pub mod metrics;
pub mod tracing;

pub use metrics::{GlobalMetrics, JobTypeMetrics, LiveMetrics, MetricsSnapshot};
pub use self::tracing::init_tracing;
