use chrono::{DateTime, Duration, Utc};

use super::job::{Job, JobStatus, StatusHistory};
use crate::error::SchedulerError;

/// A job is retired once its history holds this many ERROR entries.
pub const MAX_ERROR_HISTORY: usize = 3;

/// Status changes the scheduler itself applies to a job's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// QUEUED → SCHEDULED once a worker is reserved.
    Schedule,
    /// QUEUED → COMPLETED, DEAD after too many failed runs.
    Retire,
    /// ERROR or timed out → QUEUED.
    Requeue,
    /// CANCELLED or DONE → COMPLETED.
    Complete,
}

impl Transition {
    /// Statuses to prepend, most recent first.
    pub fn statuses(self) -> &'static [JobStatus] {
        match self {
            Transition::Schedule => &[JobStatus::Scheduled],
            Transition::Retire => &[JobStatus::Completed, JobStatus::Dead],
            Transition::Requeue => &[JobStatus::Queued],
            Transition::Complete => &[JobStatus::Completed],
        }
    }
}

/// What dispatch should do with a claimed QUEUED job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchDecision {
    /// Look for a worker.
    Reserve,
    /// Stop scheduling: the job failed too often.
    Retire,
}

/// Rules of the job lifecycle that do not touch the store.
pub struct StateMachine;

impl StateMachine {
    /// Decide between reserving a worker and retiring the job, based on how
    /// many runs ended in ERROR.
    ///
    /// More ERROR entries than the retirement threshold means an earlier pass
    /// kept requeueing a job it should have retired.
    pub fn dispatch(job: &Job) -> Result<DispatchDecision, SchedulerError> {
        let errors = job.status.count(JobStatus::Error);
        if errors > MAX_ERROR_HISTORY {
            return Err(SchedulerError::InvariantViolation {
                job_id: job.id.clone(),
                errors,
            });
        }
        if errors == MAX_ERROR_HISTORY {
            Ok(DispatchDecision::Retire)
        } else {
            Ok(DispatchDecision::Reserve)
        }
    }

    /// Whether the executor must be told to stop: the job was RUNNING and has
    /// just been cancelled or failed.
    pub fn needs_cancel(history: &StatusHistory) -> bool {
        history.previous() == Some(JobStatus::Running)
            && matches!(
                history.current(),
                Some(JobStatus::Cancelled) | Some(JobStatus::Error)
            )
    }
}

/// Marks an executor DEAD once it failed too many jobs in a trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorFailurePolicy {
    pub threshold: usize,
    pub window: Duration,
}

impl Default for ExecutorFailurePolicy {
    fn default() -> Self {
        Self {
            threshold: 3,
            window: Duration::days(7),
        }
    }
}

impl ExecutorFailurePolicy {
    /// Start of the trailing window. A window reaching past the earliest
    /// representable time covers everything.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn exceeded(&self, failures: usize) -> bool {
        failures > self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::JobType;

    fn job_with(history: Vec<JobStatus>) -> Job {
        let mut job = Job::new(JobType::Python2);
        job.status = history.into();
        job
    }

    #[test]
    fn fresh_job_is_reserved() {
        let job = job_with(vec![JobStatus::Queued]);
        assert_eq!(StateMachine::dispatch(&job).unwrap(), DispatchDecision::Reserve);
    }

    #[test]
    fn two_errors_still_reserved() {
        let job = job_with(vec![JobStatus::Queued, JobStatus::Error, JobStatus::Error]);
        assert_eq!(StateMachine::dispatch(&job).unwrap(), DispatchDecision::Reserve);
    }

    #[test]
    fn three_errors_retire() {
        let job = job_with(vec![
            JobStatus::Queued,
            JobStatus::Error,
            JobStatus::Error,
            JobStatus::Error,
        ]);
        assert_eq!(StateMachine::dispatch(&job).unwrap(), DispatchDecision::Retire);
    }

    #[test]
    fn four_errors_is_an_invariant_violation() {
        let job = job_with(vec![
            JobStatus::Queued,
            JobStatus::Error,
            JobStatus::Error,
            JobStatus::Error,
            JobStatus::Error,
        ]);
        let err = StateMachine::dispatch(&job).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::InvariantViolation { errors: 4, .. }
        ));
    }

    #[test]
    fn retire_prepends_completed_then_dead() {
        let mut history = StatusHistory::new(vec![JobStatus::Queued]);
        history.prepend(Transition::Retire.statuses());
        assert_eq!(
            history.as_slice(),
            &[JobStatus::Completed, JobStatus::Dead, JobStatus::Queued]
        );
    }

    #[test]
    fn cancel_needed_only_after_running() {
        let running_then_cancelled =
            StatusHistory::new(vec![JobStatus::Cancelled, JobStatus::Running]);
        assert!(StateMachine::needs_cancel(&running_then_cancelled));

        let running_then_error = StatusHistory::new(vec![JobStatus::Error, JobStatus::Running]);
        assert!(StateMachine::needs_cancel(&running_then_error));

        let running_then_done = StatusHistory::new(vec![JobStatus::Done, JobStatus::Running]);
        assert!(!StateMachine::needs_cancel(&running_then_done));

        let scheduled_then_cancelled =
            StatusHistory::new(vec![JobStatus::Cancelled, JobStatus::Scheduled]);
        assert!(!StateMachine::needs_cancel(&scheduled_then_cancelled));
    }

    #[test]
    fn failure_policy_threshold_is_exclusive() {
        let policy = ExecutorFailurePolicy::default();
        assert!(!policy.exceeded(3));
        assert!(policy.exceeded(4));
    }

    #[test]
    fn failure_policy_window() {
        let policy = ExecutorFailurePolicy::default();
        let now = Utc::now();
        assert_eq!(now - policy.window_start(now), Duration::days(7));

        let unbounded = ExecutorFailurePolicy {
            window: Duration::MAX,
            ..policy
        };
        assert_eq!(unbounded.window_start(now), DateTime::<Utc>::MIN_UTC);
    }
}
