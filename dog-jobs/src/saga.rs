//! Saga chains.
//!
//! A saga is a sequence of jobs where each step, inside the transaction that
//! settles it, enqueues its successor through [`JobTx::enqueue`]. The step's
//! own outcome and the successor commit or roll back together, so a failed
//! step never leaves the next one scheduled. Committed steps are not
//! compensated.
//!
//! ```rust,ignore
//! impl TransactionalJob for DeleteWorkspaceRows {
//!     fn execute(&self, p: WorkspaceRef, ctx: &JobContext, tx: &mut JobTx<'_>)
//!         -> Result<TransactionalOutcome, JobError>
//!     {
//!         tx.execute("DELETE FROM boxes WHERE workspace_id = ?1", [p.id])?;
//!         // next: purge the blobs of the deleted boxes
//!         tx.enqueue(ctx.next_step::<PurgeWorkspaceBlobs>(&p)?)?;
//!         Ok(TransactionalOutcome::success())
//!     }
//! }
//! ```
//!
//! [`JobTx::enqueue`]: crate::job::JobTx::enqueue

use crate::job::{JobContext, JobDefinition};
use crate::types::{NewJob, SagaId};
use crate::EngineResult;

impl JobContext {
    /// Build the successor step of this job's saga.
    ///
    /// The new job keeps the correlation id and the saga id; a job that is not
    /// part of a saga yet starts one.
    pub fn next_step<D: JobDefinition>(&self, payload: &D::Payload) -> EngineResult<NewJob> {
        let saga_id = self.saga_id.clone().unwrap_or_default();
        Ok(NewJob::of::<D>(payload)?
            .in_saga(saga_id)
            .with_correlation_id(self.correlation_id.clone()))
    }
}

/// First step of a new saga
pub fn start<D: JobDefinition>(payload: &D::Payload) -> EngineResult<NewJob> {
    Ok(NewJob::of::<D>(payload)?.in_saga(SagaId::new()))
}
