use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{FailedJobFilter, JobFilter, JobPatch, Store, StoreError, WorkerFilter, WorkerPatch};
use crate::state_machine::{Job, WorkerAddr, WorkerNode};

#[derive(Debug, Default)]
struct Collections {
    workers: Vec<WorkerNode>,
    jobs: Vec<Job>,
    archive: Vec<Job>,
    failed: Vec<Job>,
}

/// In-process store. Each operation runs under one mutex, which makes every
/// conditional update atomic with respect to all others.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collections(&self) -> MutexGuard<'_, Collections> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a job to the active collection, as the submission API would.
    pub fn insert_job(&self, job: Job) {
        self.collections().jobs.push(job);
    }

    /// Add a worker record, as worker self-registration would.
    pub fn insert_worker(&self, node: WorkerNode) {
        self.collections().workers.push(node);
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        self.collections().jobs.iter().find(|j| j.id == id).cloned()
    }

    pub fn worker(&self, addr: &WorkerAddr) -> Option<WorkerNode> {
        self.collections()
            .workers
            .iter()
            .find(|n| n.ip == addr.ip && n.port == addr.port)
            .cloned()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.collections().jobs.clone()
    }

    pub fn archived_jobs(&self) -> Vec<Job> {
        self.collections().archive.clone()
    }

    pub fn failed_jobs(&self) -> Vec<Job> {
        self.collections().failed.clone()
    }
}

impl Store for MemoryStore {
    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .collections()
            .jobs
            .iter()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect())
    }

    async fn update_job(&self, filter: &JobFilter, patch: &JobPatch) -> Result<bool, StoreError> {
        let mut collections = self.collections();
        match collections.jobs.iter_mut().find(|j| filter.matches(j)) {
            Some(job) => {
                patch.apply(job);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_job(&self, id: &str) -> Result<bool, StoreError> {
        let mut collections = self.collections();
        let before = collections.jobs.len();
        collections.jobs.retain(|j| j.id != id);
        Ok(collections.jobs.len() < before)
    }

    async fn find_workers(&self, filter: &WorkerFilter) -> Result<Vec<WorkerNode>, StoreError> {
        Ok(self
            .collections()
            .workers
            .iter()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect())
    }

    async fn update_worker(
        &self,
        filter: &WorkerFilter,
        patch: &WorkerPatch,
    ) -> Result<Option<WorkerNode>, StoreError> {
        let mut collections = self.collections();
        Ok(collections
            .workers
            .iter_mut()
            .find(|n| filter.matches(n))
            .map(|node| {
                let before = node.clone();
                patch.apply(node);
                before
            }))
    }

    async fn insert_archived_job(&self, job: &Job) -> Result<bool, StoreError> {
        let mut collections = self.collections();
        if collections.archive.iter().any(|j| j.id == job.id) {
            return Ok(false);
        }
        collections.archive.push(job.clone());
        Ok(true)
    }

    async fn find_archived_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .collections()
            .archive
            .iter()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect())
    }

    async fn insert_failed_job(&self, job: &Job) -> Result<(), StoreError> {
        self.collections().failed.push(job.clone());
        Ok(())
    }

    async fn find_failed_jobs(&self, filter: &FailedJobFilter) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .collections()
            .failed
            .iter()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect())
    }
}
