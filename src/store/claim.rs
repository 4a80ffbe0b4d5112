use tracing::{debug, error};

use super::{JobFilter, JobPatch, Store, StoreError};
use crate::state_machine::Job;

/// Claim the candidate `id`, still under the condition that selected it.
/// `false` means another actor got there first.
pub async fn claim_job(
    store: &impl Store,
    candidates: &JobFilter,
    id: &str,
) -> Result<bool, StoreError> {
    let claimed = store
        .update_job(&candidates.clone().with_id(id), &JobPatch::lock())
        .await?;
    if !claimed {
        debug!(job_id = id, "job claimed by another actor");
    }
    Ok(claimed)
}

/// The current record of a job this actor holds the lock on.
pub async fn locked_job(store: &impl Store, id: &str) -> Result<Job, StoreError> {
    store
        .find_jobs(&JobFilter::owned(id))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| StoreError::Corrupt(format!("job {id} is no longer locked by us")))
}

/// Best-effort unlock after a failed transition, so the job is not stranded.
pub async fn release_job(store: &impl Store, id: &str) {
    match store.update_job(&JobFilter::owned(id), &JobPatch::unlock()).await {
        Ok(true) => debug!(job_id = id, "lock released"),
        Ok(false) => debug!(job_id = id, "lock already gone"),
        Err(e) => error!(job_id = id, error = %e, "failed to release job lock"),
    }
}
