//! Job lifecycle engine: dispatch, error recovery and terminal cleanup.
//!
//! Each pass reads its candidates, then claims and processes them
//! concurrently. A claim lost to another actor is skipped; a failure on one
//! job is logged and does not stop the others.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::reservation::{cancel_reservation, free_resources, reserve_worker};
use crate::runtime::{Outcome, Sweep, TickSummary, combine};
use crate::state_machine::{
    DispatchDecision, ExecutorFailurePolicy, Job, JobStatus, StateMachine, Transition, WorkerAddr,
    WorkerStatus,
};
use crate::store::{
    FailedJobFilter, JobFilter, JobPatch, Store, WorkerFilter, WorkerPatch, claim_job, locked_job,
    release_job,
};
use crate::worker::WorkerControl;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Reserved a worker, committed SCHEDULED and told the worker to run.
    Scheduled(WorkerAddr),
    /// Three failed runs: COMPLETED, DEAD.
    Retired,
    /// No worker (or not a whole cluster) was free; the job stays QUEUED.
    NoResource,
    Contended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Requeued,
    Contended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Completed,
    Contended,
}

impl Outcome for DispatchOutcome {
    fn contended(&self) -> bool {
        matches!(self, DispatchOutcome::Contended)
    }
}

impl Outcome for RecoveryOutcome {
    fn contended(&self) -> bool {
        matches!(self, RecoveryOutcome::Contended)
    }
}

impl Outcome for CleanupOutcome {
    fn contended(&self) -> bool {
        matches!(self, CleanupOutcome::Contended)
    }
}

/// Drives QUEUED, ERROR, CANCELLED and DONE jobs to their next state.
pub struct JobScheduler<S, W> {
    store: Arc<S>,
    worker: Arc<W>,
    policy: ExecutorFailurePolicy,
}

impl<S: Store, W: WorkerControl> JobScheduler<S, W> {
    pub fn new(store: Arc<S>, worker: Arc<W>, policy: ExecutorFailurePolicy) -> Self {
        Self {
            store,
            worker,
            policy,
        }
    }

    /// One pass over every queued job.
    pub async fn dispatch_tick(&self) -> Result<TickSummary> {
        let candidates = self.store.find_jobs(&queued()).await?;
        let results = join_all(candidates.iter().map(|job| async move {
            self.dispatch(job)
                .await
                .inspect_err(|e| error!(job_id = %job.id, error = %e, "dispatch failed"))
        }))
        .await;
        Ok(TickSummary::tally(candidates.len(), &results))
    }

    /// One pass over every job whose last run ended in ERROR.
    pub async fn error_tick(&self) -> Result<TickSummary> {
        let candidates = self.store.find_jobs(&failed()).await?;
        let results = join_all(candidates.iter().map(|job| async move {
            self.recover(job)
                .await
                .inspect_err(|e| error!(job_id = %job.id, error = %e, "error recovery failed"))
        }))
        .await;
        Ok(TickSummary::tally(candidates.len(), &results))
    }

    /// One pass over every CANCELLED or DONE job.
    pub async fn cleanup_tick(&self) -> Result<TickSummary> {
        let candidates = self.store.find_jobs(&finished()).await?;
        let results = join_all(candidates.iter().map(|job| async move {
            self.cleanup(job)
                .await
                .inspect_err(|e| error!(job_id = %job.id, error = %e, "cleanup failed"))
        }))
        .await;
        Ok(TickSummary::tally(candidates.len(), &results))
    }

    /// Claim a queued job and either retire it or bind it to a worker.
    ///
    /// Scheduling is two-phase: SCHEDULED is committed first, then the worker
    /// is asked to run the job. The run request is best-effort; whatever the
    /// reply, the executor address is written and the job unlocked.
    pub async fn dispatch(&self, candidate: &Job) -> Result<DispatchOutcome> {
        if !claim_job(&*self.store, &queued(), &candidate.id).await? {
            return Ok(DispatchOutcome::Contended);
        }
        let result = self.dispatch_claimed(&candidate.id).await;
        if result.is_err() {
            release_job(&*self.store, &candidate.id).await;
        }
        result
    }

    async fn dispatch_claimed(&self, id: &str) -> Result<DispatchOutcome> {
        let store = &*self.store;
        let job = locked_job(store, id).await?;

        match StateMachine::dispatch(&job)? {
            DispatchDecision::Retire => {
                let patch = JobPatch::transition(Transition::Retire).unlocked();
                store.update_job(&JobFilter::owned(id), &patch).await?;
                info!(job_id = id, "job failed too often, now DEAD");
                Ok(DispatchOutcome::Retired)
            }
            DispatchDecision::Reserve => {
                let Some(node) = reserve_worker(store, job.job_type).await? else {
                    store.update_job(&JobFilter::owned(id), &JobPatch::unlock()).await?;
                    info!(job_id = id, job_type = %job.job_type, "no available resource");
                    return Ok(DispatchOutcome::NoResource);
                };
                let addr = node.addr();

                let schedule = JobPatch::transition(Transition::Schedule).with_start_date(Utc::now());
                match store.update_job(&JobFilter::owned(id), &schedule).await {
                    Ok(true) => {}
                    Ok(false) => {
                        cancel_reservation(store, &node, job.job_type).await;
                        error!(job_id = id, "lost the job lock while scheduling");
                        return Ok(DispatchOutcome::Contended);
                    }
                    Err(e) => {
                        cancel_reservation(store, &node, job.job_type).await;
                        return Err(e.into());
                    }
                }

                match self.worker.run(&addr, id).await {
                    Ok(status) => info!(job_id = id, worker = %addr, status, "run request sent"),
                    Err(e) => warn!(job_id = id, worker = %addr, error = %e, "run request failed"),
                }

                let bind = JobPatch::unlock().with_executor(addr.clone());
                store.update_job(&JobFilter::owned(id), &bind).await?;
                Ok(DispatchOutcome::Scheduled(addr))
            }
        }
    }

    /// Claim a failed job, report it, free what it held and queue it again.
    pub async fn recover(&self, candidate: &Job) -> Result<RecoveryOutcome> {
        if !claim_job(&*self.store, &failed(), &candidate.id).await? {
            return Ok(RecoveryOutcome::Contended);
        }
        let result = self.recover_claimed(&candidate.id).await;
        if result.is_err() {
            release_job(&*self.store, &candidate.id).await;
        }
        result
    }

    async fn recover_claimed(&self, id: &str) -> Result<RecoveryOutcome> {
        let store = &*self.store;
        let job = locked_job(store, id).await?;

        self.report_failure(&job).await;
        free_resources(store, &*self.worker, &job).await?;

        let requeue = JobPatch::transition(Transition::Requeue).unlocked();
        store.update_job(&JobFilter::owned(id), &requeue).await?;
        info!(job_id = id, "failed job requeued");
        Ok(RecoveryOutcome::Requeued)
    }

    /// Archive a copy of the failed job and retire its executor if it failed
    /// too many jobs lately. Nothing here blocks the requeue.
    async fn report_failure(&self, job: &Job) {
        if let Err(e) = self.archive_failure(job).await {
            error!(job_id = %job.id, error = %e, "failed to archive failed job");
        }
        let Some(executor) = &job.executor else {
            return;
        };
        if let Err(e) = self.check_executor(executor).await {
            error!(worker = %executor, error = %e, "failed to evaluate executor failures");
        }
    }

    /// One failed-archive entry per failed run. A recovery retried after a
    /// later step failed finds the entry of the same run and writes nothing.
    async fn archive_failure(&self, job: &Job) -> Result<()> {
        let earlier = self
            .store
            .find_failed_jobs(&FailedJobFilter::by_job(job.id.clone()))
            .await?;
        if earlier.iter().any(|e| e.start_date == job.start_date) {
            debug!(job_id = %job.id, "failed run already archived");
            return Ok(());
        }
        self.store.insert_failed_job(job).await?;
        Ok(())
    }

    async fn check_executor(&self, executor: &WorkerAddr) -> Result<()> {
        let since = self.policy.window_start(Utc::now());
        let failures = self
            .store
            .find_failed_jobs(&FailedJobFilter::executor_since(executor.clone(), since))
            .await?
            .len();
        if !self.policy.exceeded(failures) {
            return Ok(());
        }

        let dead = WorkerPatch::new(WorkerStatus::Dead, true);
        match self
            .store
            .update_worker(&WorkerFilter::by_addr(executor.clone()), &dead)
            .await?
        {
            Some(_) => warn!(worker = %executor, failures, "executor set to DEAD after repeated job failures"),
            None => warn!(worker = %executor, "executor over failure threshold has no status record"),
        }
        Ok(())
    }

    /// Claim a cancelled or finished job, free what it held and mark it
    /// COMPLETED.
    pub async fn cleanup(&self, candidate: &Job) -> Result<CleanupOutcome> {
        if !claim_job(&*self.store, &finished(), &candidate.id).await? {
            return Ok(CleanupOutcome::Contended);
        }
        let result = self.cleanup_claimed(&candidate.id).await;
        if result.is_err() {
            release_job(&*self.store, &candidate.id).await;
        }
        result
    }

    async fn cleanup_claimed(&self, id: &str) -> Result<CleanupOutcome> {
        let store = &*self.store;
        let job = locked_job(store, id).await?;

        free_resources(store, &*self.worker, &job).await?;

        let mut complete = JobPatch::transition(Transition::Complete).unlocked();
        if job.end_date.is_none() {
            complete = complete.with_end_date(Utc::now());
        }
        store.update_job(&JobFilter::owned(id), &complete).await?;
        debug!(job_id = id, "job completed");
        Ok(CleanupOutcome::Completed)
    }
}

impl<S: Store, W: WorkerControl> Sweep for JobScheduler<S, W> {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    /// Dispatch, error recovery and terminal cleanup, in that order.
    async fn tick(&self) -> Result<TickSummary> {
        combine([
            self.dispatch_tick().await,
            self.error_tick().await,
            self.cleanup_tick().await,
        ])
    }
}

fn queued() -> JobFilter {
    JobFilter::claimable(&[JobStatus::Queued])
}

fn failed() -> JobFilter {
    JobFilter::claimable(&[JobStatus::Error])
}

fn finished() -> JobFilter {
    JobFilter::claimable(&[JobStatus::Cancelled, JobStatus::Done])
}
