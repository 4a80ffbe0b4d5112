use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A job was requeued past its own retirement threshold.
    #[error("Job {job_id} has {errors} errors in its history, it should already be retired")]
    InvariantViolation { job_id: String, errors: usize },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
