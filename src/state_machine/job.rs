use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::WorkerAddr;

/// Status tags a job moves through.
///
/// QUEUED → SCHEDULED → RUNNING → {ERROR, CANCELLED, DONE} → COMPLETED.
/// RUNNING and the transitions out of it are reported by workers; the
/// scheduler only reads them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Scheduled,
    Running,
    Error,
    Cancelled,
    Done,
    Completed,
    Dead,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Scheduled => "SCHEDULED",
            JobStatus::Running => "RUNNING",
            JobStatus::Error => "ERROR",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Done => "DONE",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Dead => "DEAD",
        };
        write!(f, "{tag}")
    }
}

/// Prepend-only status history, most recent first.
///
/// Index 0 is the current status. Entries are never removed or reordered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusHistory(Vec<JobStatus>);

impl StatusHistory {
    pub fn new(entries: Vec<JobStatus>) -> Self {
        Self(entries)
    }

    pub fn current(&self) -> Option<JobStatus> {
        self.0.first().copied()
    }

    /// The status the job held right before the current one.
    pub fn previous(&self) -> Option<JobStatus> {
        self.0.get(1).copied()
    }

    /// Prepends `statuses` keeping their order, so `statuses[0]` becomes current.
    pub fn prepend(&mut self, statuses: &[JobStatus]) {
        self.0.splice(0..0, statuses.iter().copied());
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.0.iter().filter(|s| **s == status).count()
    }

    pub fn as_slice(&self) -> &[JobStatus] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<JobStatus>> for StatusHistory {
    fn from(entries: Vec<JobStatus>) -> Self {
        Self(entries)
    }
}

/// How a job type claims and gives back compute nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStrategy {
    /// One worker runs the job on its own.
    Single,
    /// A parent worker plus every member listed under this cluster key.
    Cluster(&'static str),
}

/// Closed set of job kinds served by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Python2,
    R,
    Pig,
    Tensorflow,
    Spark,
}

impl JobType {
    pub fn strategy(self) -> ReservationStrategy {
        match self {
            JobType::Spark => ReservationStrategy::Cluster("spark"),
            JobType::Python2 | JobType::R | JobType::Pig | JobType::Tensorflow => {
                ReservationStrategy::Single
            }
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobType::Python2 => "python2",
            JobType::R => "r",
            JobType::Pig => "pig",
            JobType::Tensorflow => "tensorflow",
            JobType::Spark => "spark",
        };
        write!(f, "{name}")
    }
}

/// A compute job as stored in the active jobs collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub status: StatusHistory,
    pub status_lock: bool,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<WorkerAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    /// Input file names, stored in the `<id>_input` container.
    #[serde(default)]
    pub input: Vec<String>,
    /// Output file names, stored in the `<id>_output` container.
    #[serde(default)]
    pub output: Vec<String>,
}

impl Job {
    /// A freshly queued, unlocked job.
    pub fn new(job_type: JobType) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            status: StatusHistory::new(vec![JobStatus::Queued]),
            status_lock: false,
            job_type,
            executor: None,
            start_date: None,
            end_date: None,
            input: Vec::new(),
            output: Vec::new(),
        }
    }

    pub fn current_status(&self) -> Option<JobStatus> {
        self.status.current()
    }

    pub fn input_container(&self) -> String {
        format!("{}_input", self.id)
    }

    pub fn output_container(&self) -> String {
        format!("{}_output", self.id)
    }
}
