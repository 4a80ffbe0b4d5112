//! Typed filters and patches for the four collections.
//!
//! Filters express the "decide" half of every read-decide-write sequence: the
//! same filter that selected a candidate is reused, narrowed to the record's
//! key, as the condition of the write. A write whose filter no longer matches
//! lost the race to another actor.

use chrono::{DateTime, Utc};

use crate::state_machine::{
    Job, JobStatus, JobType, Transition, WorkerAddr, WorkerNode, WorkerStatus,
};

/// Selects records of the active (or archived) jobs collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub id: Option<String>,
    /// Matches when the current status (history index 0) is one of these.
    pub current_status: Option<Vec<JobStatus>>,
    pub status_lock: Option<bool>,
    /// Matches jobs with a start date strictly before this instant.
    pub started_before: Option<DateTime<Utc>>,
    /// Matches jobs with an end date strictly before this instant.
    pub ended_before: Option<DateTime<Utc>>,
}

impl JobFilter {
    /// Unlocked jobs whose current status is one of `statuses`.
    pub fn claimable(statuses: &[JobStatus]) -> Self {
        Self {
            current_status: Some(statuses.to_vec()),
            status_lock: Some(false),
            ..Default::default()
        }
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    /// Writes issued by the actor currently holding the job's lock.
    pub fn owned(id: impl Into<String>) -> Self {
        Self::by_id(id).locked(true)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn locked(mut self, status_lock: bool) -> Self {
        self.status_lock = Some(status_lock);
        self
    }

    pub fn started_before(mut self, at: DateTime<Utc>) -> Self {
        self.started_before = Some(at);
        self
    }

    pub fn ended_before(mut self, at: DateTime<Utc>) -> Self {
        self.ended_before = Some(at);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(id) = &self.id {
            if &job.id != id {
                return false;
            }
        }
        if let Some(statuses) = &self.current_status {
            match job.current_status() {
                Some(current) if statuses.contains(&current) => {}
                _ => return false,
            }
        }
        if let Some(lock) = self.status_lock {
            if job.status_lock != lock {
                return false;
            }
        }
        if let Some(limit) = self.started_before {
            if !job.start_date.is_some_and(|d| d < limit) {
                return false;
            }
        }
        if let Some(limit) = self.ended_before {
            if !job.end_date.is_some_and(|d| d < limit) {
                return false;
            }
        }
        true
    }
}

/// Changes applied to a job by a conditional update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    /// Statuses to put in front of the history, most recent first.
    pub prepend: Vec<JobStatus>,
    pub status_lock: Option<bool>,
    pub executor: Option<WorkerAddr>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl JobPatch {
    /// The claim: `statusLock` false → true.
    pub fn lock() -> Self {
        Self {
            status_lock: Some(true),
            ..Default::default()
        }
    }

    pub fn unlock() -> Self {
        Self {
            status_lock: Some(false),
            ..Default::default()
        }
    }

    pub fn transition(transition: Transition) -> Self {
        Self {
            prepend: transition.statuses().to_vec(),
            ..Default::default()
        }
    }

    pub fn unlocked(mut self) -> Self {
        self.status_lock = Some(false);
        self
    }

    pub fn with_executor(mut self, addr: WorkerAddr) -> Self {
        self.executor = Some(addr);
        self
    }

    pub fn with_start_date(mut self, at: DateTime<Utc>) -> Self {
        self.start_date = Some(at);
        self
    }

    pub fn with_end_date(mut self, at: DateTime<Utc>) -> Self {
        self.end_date = Some(at);
        self
    }

    pub fn apply(&self, job: &mut Job) {
        job.status.prepend(&self.prepend);
        if let Some(lock) = self.status_lock {
            job.status_lock = lock;
        }
        if let Some(addr) = &self.executor {
            job.executor = Some(addr.clone());
        }
        if let Some(at) = self.start_date {
            job.start_date = Some(at);
        }
        if let Some(at) = self.end_date {
            job.end_date = Some(at);
        }
    }
}

/// Selects records of the worker status collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerFilter {
    pub addr: Option<WorkerAddr>,
    pub statuses: Option<Vec<WorkerStatus>>,
    pub compute_type: Option<JobType>,
    pub status_lock: Option<bool>,
    /// Matches nodes whose last report is strictly before this instant.
    pub updated_before: Option<DateTime<Utc>>,
}

impl WorkerFilter {
    pub fn by_addr(addr: WorkerAddr) -> Self {
        Self {
            addr: Some(addr),
            ..Default::default()
        }
    }

    /// Nodes in one of `statuses`, locked or not.
    pub fn in_status(statuses: &[WorkerStatus]) -> Self {
        Self {
            statuses: Some(statuses.to_vec()),
            ..Default::default()
        }
    }

    /// Unlocked nodes in one of `statuses`.
    pub fn claimable(statuses: &[WorkerStatus]) -> Self {
        Self::in_status(statuses).locked(false)
    }

    /// Unlocked idle nodes serving `job_type`.
    pub fn available(job_type: JobType) -> Self {
        Self {
            compute_type: Some(job_type),
            ..Self::claimable(&[WorkerStatus::Idle])
        }
    }

    pub fn with_addr(mut self, addr: WorkerAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn locked(mut self, status_lock: bool) -> Self {
        self.status_lock = Some(status_lock);
        self
    }

    pub fn updated_before(mut self, at: DateTime<Utc>) -> Self {
        self.updated_before = Some(at);
        self
    }

    pub fn matches(&self, node: &WorkerNode) -> bool {
        if let Some(addr) = &self.addr {
            if node.ip != addr.ip || node.port != addr.port {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&node.status) {
                return false;
            }
        }
        if let Some(compute_type) = self.compute_type {
            if node.compute_type != compute_type {
                return false;
            }
        }
        if let Some(lock) = self.status_lock {
            if node.status_lock != lock {
                return false;
            }
        }
        if let Some(limit) = self.updated_before {
            if node.last_update >= limit {
                return false;
            }
        }
        true
    }
}

/// Changes applied to a worker by a conditional update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerPatch {
    pub status: Option<WorkerStatus>,
    pub status_lock: Option<bool>,
}

impl WorkerPatch {
    pub fn new(status: WorkerStatus, status_lock: bool) -> Self {
        Self {
            status: Some(status),
            status_lock: Some(status_lock),
        }
    }

    pub fn lock() -> Self {
        Self {
            status: None,
            status_lock: Some(true),
        }
    }

    pub fn status(status: WorkerStatus) -> Self {
        Self {
            status: Some(status),
            status_lock: None,
        }
    }

    /// Back in the pool: IDLE and unlocked.
    pub fn release() -> Self {
        Self::new(WorkerStatus::Idle, false)
    }

    pub fn apply(&self, node: &mut WorkerNode) {
        if let Some(status) = self.status {
            node.status = status;
        }
        if let Some(lock) = self.status_lock {
            node.status_lock = lock;
        }
    }
}

/// Selects records of the failed-jobs archive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailedJobFilter {
    pub job_id: Option<String>,
    pub executor: Option<WorkerAddr>,
    /// Matches jobs started at or after this instant.
    pub started_since: Option<DateTime<Utc>>,
}

impl FailedJobFilter {
    pub fn by_job(id: impl Into<String>) -> Self {
        Self {
            job_id: Some(id.into()),
            ..Default::default()
        }
    }

    /// Failures of `executor` whose run started at or after `since`.
    pub fn executor_since(executor: WorkerAddr, since: DateTime<Utc>) -> Self {
        Self {
            job_id: None,
            executor: Some(executor),
            started_since: Some(since),
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(id) = &self.job_id {
            if &job.id != id {
                return false;
            }
        }
        if let Some(executor) = &self.executor {
            if job.executor.as_ref() != Some(executor) {
                return false;
            }
        }
        if let Some(since) = self.started_since {
            if !job.start_date.is_some_and(|d| d >= since) {
                return false;
            }
        }
        true
    }
}
