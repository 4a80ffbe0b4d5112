//! Persistence contract shared by every control loop.
//!
//! The only concurrency primitive is the conditional single-record update:
//! a write succeeds only if the record still satisfies the filter. Every
//! claim is `statusLock: false → true` through [`Store::update_job`] or
//! [`Store::update_worker`], and an unmatched write means another actor owns
//! the record now.
//!
//! Four logical collections back the contract: worker status, active jobs,
//! archived jobs and archived failed jobs.

mod claim;
mod error;
mod filter;
pub mod memory;
pub mod mongo;

use std::future::Future;

pub use claim::{claim_job, locked_job, release_job};
pub use error::StoreError;
pub use filter::{FailedJobFilter, JobFilter, JobPatch, WorkerFilter, WorkerPatch};
pub use memory::MemoryStore;
pub use mongo::MongoStore;

use crate::state_machine::{Job, WorkerNode};

pub trait Store: Send + Sync {
    /// All active jobs matching `filter`.
    fn find_jobs(
        &self,
        filter: &JobFilter,
    ) -> impl Future<Output = Result<Vec<Job>, StoreError>> + Send;

    /// Atomically patch one active job matching `filter`. Returns whether a
    /// record matched.
    fn update_job(
        &self,
        filter: &JobFilter,
        patch: &JobPatch,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Remove a job from the active collection. Returns whether it was there.
    fn delete_job(&self, id: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// All worker records matching `filter`.
    fn find_workers(
        &self,
        filter: &WorkerFilter,
    ) -> impl Future<Output = Result<Vec<WorkerNode>, StoreError>> + Send;

    /// Atomically patch one worker matching `filter`, returning the record as
    /// it was before the patch, or `None` if nothing matched.
    fn update_worker(
        &self,
        filter: &WorkerFilter,
        patch: &WorkerPatch,
    ) -> impl Future<Output = Result<Option<WorkerNode>, StoreError>> + Send;

    /// Copy a job into the archive unless a copy with the same id is already
    /// there. Returns whether a copy was written.
    fn insert_archived_job(
        &self,
        job: &Job,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn find_archived_jobs(
        &self,
        filter: &JobFilter,
    ) -> impl Future<Output = Result<Vec<Job>, StoreError>> + Send;

    /// Append a copy of a failed job to the failed-jobs archive. A job that
    /// fails several times gets one entry per failure.
    fn insert_failed_job(&self, job: &Job) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn find_failed_jobs(
        &self,
        filter: &FailedJobFilter,
    ) -> impl Future<Output = Result<Vec<Job>, StoreError>> + Send;
}
