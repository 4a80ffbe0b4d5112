use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use super::cutoff;
use crate::error::Result;
use crate::reservation::release_cluster;
use crate::runtime::{Outcome, Sweep, TickSummary, combine};
use crate::state_machine::{Job, JobStatus, Transition};
use crate::storage::{ObjectStorage, purge_container};
use crate::store::{JobFilter, JobPatch, Store, claim_job, locked_job, release_job};
use crate::worker::WorkerControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    Requeued,
    Contended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Archived,
    /// Claim lost, usually because an earlier sweep already moved the job.
    Contended,
}

impl Outcome for TimeoutOutcome {
    fn contended(&self) -> bool {
        matches!(self, TimeoutOutcome::Contended)
    }
}

impl Outcome for ArchiveOutcome {
    fn contended(&self) -> bool {
        matches!(self, ArchiveOutcome::Contended)
    }
}

/// Requeues runaway jobs and archives old completed ones.
pub struct JobsWatchdog<S, W, O> {
    store: Arc<S>,
    worker: Arc<W>,
    storage: Arc<O>,
    archiving_enabled: bool,
    archive_after: chrono::Duration,
    timeout: chrono::Duration,
    release_on_timeout: bool,
}

impl<S: Store, W: WorkerControl, O: ObjectStorage> JobsWatchdog<S, W, O> {
    pub fn new(
        store: Arc<S>,
        worker: Arc<W>,
        storage: Arc<O>,
        config: &SchedulerConfig,
    ) -> Result<Self> {
        Ok(Self {
            store,
            worker,
            storage,
            archiving_enabled: config.archiving_enabled,
            archive_after: config.archive_after()?,
            timeout: config.job_timeout()?,
            release_on_timeout: config.release_resources_on_timeout,
        })
    }

    /// Requeue every SCHEDULED or RUNNING job started before the timeout.
    pub async fn timeout_tick(&self) -> Result<TickSummary> {
        let candidates = JobFilter::claimable(&[JobStatus::Scheduled, JobStatus::Running])
            .started_before(cutoff(self.timeout)?);
        let jobs = self.store.find_jobs(&candidates).await?;
        let candidates = &candidates;
        let results = join_all(jobs.iter().map(|job| async move {
            self.invalidate(job, candidates)
                .await
                .inspect_err(|e| error!(job_id = %job.id, error = %e, "timeout invalidation failed"))
        }))
        .await;
        Ok(TickSummary::tally(jobs.len(), &results))
    }

    /// Archive every COMPLETED job that ended before the retention window.
    /// Does nothing when archiving is disabled.
    pub async fn archive_tick(&self) -> Result<TickSummary> {
        if !self.archiving_enabled {
            return Ok(TickSummary::default());
        }
        let candidates = JobFilter::claimable(&[JobStatus::Completed])
            .ended_before(cutoff(self.archive_after)?);
        let jobs = self.store.find_jobs(&candidates).await?;
        let candidates = &candidates;
        let results = join_all(jobs.iter().map(|job| async move {
            self.archive(job, candidates)
                .await
                .inspect_err(|e| error!(job_id = %job.id, error = %e, "archival failed"))
        }))
        .await;
        Ok(TickSummary::tally(jobs.len(), &results))
    }

    /// Claim a timed-out job, ask its executor to stop it and queue it again.
    ///
    /// Bound cluster nodes are only released here when configured to; by
    /// default they come back through the executor's own report or node
    /// expiry.
    pub async fn invalidate(&self, candidate: &Job, candidates: &JobFilter) -> Result<TimeoutOutcome> {
        if !claim_job(&*self.store, candidates, &candidate.id).await? {
            return Ok(TimeoutOutcome::Contended);
        }
        let result = self.invalidate_claimed(&candidate.id).await;
        if result.is_err() {
            release_job(&*self.store, &candidate.id).await;
        }
        result
    }

    async fn invalidate_claimed(&self, id: &str) -> Result<TimeoutOutcome> {
        let store = &*self.store;
        let job = locked_job(store, id).await?;

        match &job.executor {
            Some(addr) => match self.worker.cancel(addr, id).await {
                Ok(status) => info!(job_id = id, worker = %addr, status, "cancel request sent"),
                Err(e) => warn!(job_id = id, worker = %addr, error = %e, "cancel request failed"),
            },
            None => debug!(job_id = id, "timed-out job has no executor"),
        }

        if self.release_on_timeout {
            release_cluster(store, &job).await?;
        }

        let requeue = JobPatch::transition(Transition::Requeue).unlocked();
        store.update_job(&JobFilter::owned(id), &requeue).await?;
        info!(job_id = id, "timed-out job requeued");
        Ok(TimeoutOutcome::Requeued)
    }

    /// Claim a completed job, move it to the archive and purge its files.
    ///
    /// The archive copy is written only if absent, so a sweep that failed
    /// after the copy but before the delete is finished by a later one.
    pub async fn archive(&self, candidate: &Job, candidates: &JobFilter) -> Result<ArchiveOutcome> {
        if !claim_job(&*self.store, candidates, &candidate.id).await? {
            return Ok(ArchiveOutcome::Contended);
        }
        let result = self.archive_claimed(&candidate.id).await;
        if result.is_err() {
            release_job(&*self.store, &candidate.id).await;
        }
        result
    }

    async fn archive_claimed(&self, id: &str) -> Result<ArchiveOutcome> {
        let store = &*self.store;
        let mut job = locked_job(store, id).await?;
        job.status_lock = false;

        if !store.insert_archived_job(&job).await? {
            debug!(job_id = id, "archive copy already present");
        }
        store.delete_job(id).await?;
        info!(job_id = id, "job archived");

        let storage = &*self.storage;
        purge_container(storage, &job.input_container(), &job.input).await;
        purge_container(storage, &job.output_container(), &job.output).await;
        Ok(ArchiveOutcome::Archived)
    }
}

impl<S: Store, W: WorkerControl, O: ObjectStorage> Sweep for JobsWatchdog<S, W, O> {
    fn name(&self) -> &'static str {
        "jobs-watchdog"
    }

    async fn tick(&self) -> Result<TickSummary> {
        combine([self.archive_tick().await, self.timeout_tick().await])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;
    use crate::state_machine::{ClusterMember, JobType, WorkerAddr, WorkerNode, WorkerStatus};
    use crate::storage::StorageError;
    use crate::store::{MemoryStore, WorkerFilter, WorkerPatch};
    use crate::worker::WorkerError;

    #[derive(Default)]
    struct MockWorker {
        cancels: Mutex<Vec<String>>,
    }

    impl WorkerControl for MockWorker {
        async fn run(&self, _addr: &WorkerAddr, _job_id: &str) -> std::result::Result<u16, WorkerError> {
            Ok(200)
        }

        async fn cancel(&self, _addr: &WorkerAddr, job_id: &str) -> std::result::Result<u16, WorkerError> {
            self.cancels.lock().unwrap().push(job_id.to_string());
            Err(WorkerError::Client("connection refused".into()))
        }
    }

    #[derive(Default)]
    struct MockStorage {
        deleted: Mutex<Vec<String>>,
    }

    impl ObjectStorage for MockStorage {
        async fn delete_file(&self, container: &str, file: &str) -> std::result::Result<(), StorageError> {
            self.deleted.lock().unwrap().push(format!("{container}/{file}"));
            Ok(())
        }

        async fn delete_container(&self, container: &str) -> std::result::Result<(), StorageError> {
            self.deleted.lock().unwrap().push(container.to_string());
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        worker: Arc<MockWorker>,
        storage: Arc<MockStorage>,
        watchdog: JobsWatchdog<MemoryStore, MockWorker, MockStorage>,
    }

    fn fixture(config: SchedulerConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let worker = Arc::new(MockWorker::default());
        let storage = Arc::new(MockStorage::default());
        let watchdog = JobsWatchdog::new(
            Arc::clone(&store),
            Arc::clone(&worker),
            Arc::clone(&storage),
            &config,
        )
        .unwrap();
        Fixture {
            store,
            worker,
            storage,
            watchdog,
        }
    }

    fn completed_long_ago() -> Job {
        let mut job = Job::new(JobType::R);
        job.status = vec![JobStatus::Completed, JobStatus::Done].into();
        job.end_date = Some(Utc::now() - chrono::Duration::days(60));
        job.input = vec!["data.csv".into()];
        job
    }

    fn running_since(hours: i64) -> Job {
        let mut job = Job::new(JobType::Spark);
        job.status = vec![JobStatus::Running, JobStatus::Scheduled, JobStatus::Queued].into();
        job.start_date = Some(Utc::now() - chrono::Duration::hours(hours));
        job.executor = Some(WorkerAddr::new("10.0.0.1", 7000));
        job
    }

    #[tokio::test]
    async fn timed_out_job_is_requeued_despite_cancel_failure() {
        let f = fixture(SchedulerConfig::default());
        let job = running_since(30);
        let fresh = running_since(1);
        f.store.insert_job(job.clone());
        f.store.insert_job(fresh.clone());

        let summary = f.watchdog.timeout_tick().await.unwrap();
        assert_eq!(summary.candidates, 1);
        assert_eq!(summary.completed, 1);

        let stored = f.store.job(&job.id).unwrap();
        assert_eq!(stored.current_status(), Some(JobStatus::Queued));
        assert_eq!(stored.status.len(), 4);
        assert!(!stored.status_lock);
        assert_eq!(*f.worker.cancels.lock().unwrap(), vec![job.id.clone()]);
        assert_eq!(
            f.store.job(&fresh.id).unwrap().current_status(),
            Some(JobStatus::Running)
        );
    }

    #[tokio::test]
    async fn timeout_releases_cluster_when_configured() {
        let f = fixture(SchedulerConfig {
            release_resources_on_timeout: true,
            ..Default::default()
        });
        let mut parent = WorkerNode::new(WorkerAddr::new("10.0.0.1", 7000), JobType::Spark);
        parent.clusters.insert(
            "spark".into(),
            vec![ClusterMember {
                ip: "10.0.0.1".into(),
                port: 7001,
                status_lock: true,
            }],
        );
        f.store.insert_worker(parent);
        let member = WorkerAddr::new("10.0.0.1", 7001);
        f.store.insert_worker(WorkerNode::new(member.clone(), JobType::Spark));
        f.store
            .update_worker(
                &WorkerFilter::by_addr(member.clone()),
                &WorkerPatch::new(WorkerStatus::Busy, true),
            )
            .await
            .unwrap();
        f.store.insert_job(running_since(30));

        f.watchdog.timeout_tick().await.unwrap();

        let released = f.store.worker(&member).unwrap();
        assert_eq!(released.status, WorkerStatus::Idle);
        assert!(!released.status_lock);
    }

    #[tokio::test]
    async fn archival_moves_job_and_purges_containers() {
        let f = fixture(SchedulerConfig::default());
        let job = completed_long_ago();
        f.store.insert_job(job.clone());

        let summary = f.watchdog.archive_tick().await.unwrap();
        assert_eq!(summary.completed, 1);

        assert!(f.store.job(&job.id).is_none());
        let archived = f.store.archived_jobs();
        assert_eq!(archived.len(), 1);
        assert!(!archived[0].status_lock);
        assert_eq!(
            *f.storage.deleted.lock().unwrap(),
            vec![
                format!("{}_input/data.csv", job.id),
                format!("{}_input", job.id),
                format!("{}_output", job.id),
            ]
        );
    }

    #[tokio::test]
    async fn recent_completion_is_kept() {
        let f = fixture(SchedulerConfig::default());
        let mut job = completed_long_ago();
        job.end_date = Some(Utc::now() - chrono::Duration::hours(1));
        f.store.insert_job(job.clone());

        assert_eq!(f.watchdog.archive_tick().await.unwrap().candidates, 0);
        assert!(f.store.job(&job.id).is_some());
    }

    #[tokio::test]
    async fn archiving_disabled_still_invalidates_timeouts() {
        let f = fixture(SchedulerConfig {
            archiving_enabled: false,
            ..Default::default()
        });
        let done = completed_long_ago();
        let runaway = running_since(48);
        f.store.insert_job(done.clone());
        f.store.insert_job(runaway.clone());

        f.watchdog.tick().await.unwrap();

        assert!(f.store.job(&done.id).is_some());
        assert_eq!(
            f.store.job(&runaway.id).unwrap().current_status(),
            Some(JobStatus::Queued)
        );
    }

    #[tokio::test]
    async fn archival_finishes_an_interrupted_move() {
        let f = fixture(SchedulerConfig::default());
        let job = completed_long_ago();
        f.store.insert_archived_job(&job).await.unwrap();
        f.store.insert_job(job.clone());

        f.watchdog.archive_tick().await.unwrap();
        f.watchdog.archive_tick().await.unwrap();

        assert!(f.store.jobs().is_empty());
        assert_eq!(f.store.archived_jobs().len(), 1);
    }

    #[tokio::test]
    async fn unrepresentable_timeout_fails_the_tick_without_panicking() {
        let f = fixture(SchedulerConfig {
            jobs_timingout_time: 10_000_000_000,
            ..Default::default()
        });
        f.store.insert_job(running_since(30));

        let err = f.watchdog.timeout_tick().await.unwrap_err();
        assert!(matches!(err, crate::error::SchedulerError::Config(_)));
        assert_eq!(f.store.jobs()[0].current_status(), Some(JobStatus::Running));
    }

    #[test]
    fn wrapping_retention_is_refused_at_construction() {
        let config = SchedulerConfig {
            jobs_expired_status_time: u64::MAX,
            ..Default::default()
        };
        let built = JobsWatchdog::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockWorker::default()),
            Arc::new(MockStorage::default()),
            &config,
        );
        assert!(built.is_err());
    }
}
