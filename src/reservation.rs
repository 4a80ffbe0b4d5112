//! Claiming and giving back compute nodes.
//!
//! A reservation is all-or-nothing: a cluster job either holds its parent
//! worker (LOCKED) and every member (BUSY), or nothing it touched stays
//! locked once [`reserve_worker`] returns.

use tracing::{debug, error, info, warn};

use crate::state_machine::{
    Job, JobType, ReservationStrategy, StateMachine, WorkerAddr, WorkerNode, WorkerStatus,
};
use crate::store::{Store, StoreError, WorkerFilter, WorkerPatch};
use crate::worker::WorkerControl;

/// Claim a worker able to run `job_type`.
///
/// Returns the parent's record as it was before the claim, or `None` when no
/// worker (or not every cluster member) could be claimed. `None` is the
/// ordinary "no resource available" outcome, not an error.
pub async fn reserve_worker(
    store: &impl Store,
    job_type: JobType,
) -> Result<Option<WorkerNode>, StoreError> {
    let claim = WorkerPatch::new(WorkerStatus::Locked, true);
    let Some(parent) = store
        .update_worker(&WorkerFilter::available(job_type), &claim)
        .await?
    else {
        debug!(%job_type, "no idle worker");
        return Ok(None);
    };

    match job_type.strategy() {
        ReservationStrategy::Single => Ok(Some(parent)),
        ReservationStrategy::Cluster(key) => reserve_cluster(store, parent, key).await,
    }
}

async fn reserve_cluster(
    store: &impl Store,
    parent: WorkerNode,
    key: &str,
) -> Result<Option<WorkerNode>, StoreError> {
    let members = parent.cluster(key);
    let mut locked: Vec<WorkerAddr> = Vec::with_capacity(members.len());

    for member in members.iter().filter(|m| !m.status_lock) {
        let filter = WorkerFilter::by_addr(member.addr()).locked(false);
        match store.update_worker(&filter, &WorkerPatch::lock()).await {
            Ok(Some(_)) => locked.push(member.addr()),
            Ok(None) => debug!(member = %member.addr(), "cluster member already claimed"),
            Err(e) => {
                rollback(store, &parent, &locked).await;
                return Err(e);
            }
        }
    }

    if locked.len() != members.len() {
        info!(
            node = %parent.addr(),
            cluster = key,
            acquired = locked.len(),
            size = members.len(),
            "cluster not fully available, rolling back"
        );
        rollback(store, &parent, &locked).await;
        return Ok(None);
    }

    for addr in &locked {
        let filter = WorkerFilter::by_addr(addr.clone()).locked(true);
        if let Err(e) = store
            .update_worker(&filter, &WorkerPatch::status(WorkerStatus::Busy))
            .await
        {
            // The member stays locked, which still keeps it out of other reservations.
            error!(member = %addr, error = %e, "failed to mark cluster member BUSY");
        }
    }
    Ok(Some(parent))
}

/// Release every member this reservation locked, then the parent. Failures
/// are logged; node expiry reclaims whatever is left behind.
async fn rollback(store: &impl Store, parent: &WorkerNode, locked: &[WorkerAddr]) {
    let parent_addr = parent.addr();
    for addr in locked.iter().chain(std::iter::once(&parent_addr)) {
        let filter = WorkerFilter::by_addr(addr.clone()).locked(true);
        if let Err(e) = store.update_worker(&filter, &WorkerPatch::release()).await {
            error!(node = %addr, error = %e, "failed to release node during rollback");
        }
    }
}

/// Undo a successful [`reserve_worker`] for a job that could not be
/// scheduled after all.
pub async fn cancel_reservation(store: &impl Store, node: &WorkerNode, job_type: JobType) {
    let members: Vec<WorkerAddr> = match job_type.strategy() {
        ReservationStrategy::Single => Vec::new(),
        ReservationStrategy::Cluster(key) => node.cluster(key).iter().map(|m| m.addr()).collect(),
    };
    rollback(store, node, &members).await;
}

/// Give back what `job` holds: cancel the run if the worker was still
/// running it, then return cluster members to the pool.
pub async fn free_resources(
    store: &impl Store,
    worker: &impl WorkerControl,
    job: &Job,
) -> Result<(), StoreError> {
    if StateMachine::needs_cancel(&job.status) {
        match &job.executor {
            Some(addr) => {
                if let Err(e) = worker.cancel(addr, &job.id).await {
                    warn!(job_id = %job.id, worker = %addr, error = %e, "cancel request failed");
                }
            }
            None => warn!(job_id = %job.id, "job has no executor to cancel"),
        }
    }
    release_cluster(store, job).await
}

/// Reset every member of the cluster bound to `job` to IDLE and unlocked,
/// whatever its current lock. The parent record is left as it is.
pub async fn release_cluster(store: &impl Store, job: &Job) -> Result<(), StoreError> {
    let ReservationStrategy::Cluster(key) = job.job_type.strategy() else {
        return Ok(());
    };
    let Some(executor) = &job.executor else {
        warn!(job_id = %job.id, "cluster job has no executor, nothing to release");
        return Ok(());
    };

    let parents = store
        .find_workers(&WorkerFilter::by_addr(executor.clone()))
        .await?;
    let Some(parent) = parents.first() else {
        warn!(job_id = %job.id, worker = %executor, "executor record not found");
        return Ok(());
    };

    for member in parent.cluster(key) {
        let released = store
            .update_worker(&WorkerFilter::by_addr(member.addr()), &WorkerPatch::release())
            .await?;
        if released.is_none() {
            warn!(member = %member.addr(), "cluster member record not found");
        }
    }
    debug!(job_id = %job.id, worker = %executor, "cluster released");
    Ok(())
}
