pub mod ids;
pub mod priority;
pub mod new_job;
pub mod record;
pub mod events;

pub use ids::{JobId, SagaId, CorrelationId};
pub use priority::JobPriority;
pub use new_job::NewJob;
pub use record::{JobRecord, JobState};
pub use events::JobEvent;
