//! Health monitors for jobs and worker nodes.

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};

pub mod jobs;
pub mod nodes;

pub use jobs::{ArchiveOutcome, JobsWatchdog, TimeoutOutcome};
pub use nodes::{NodeOutcome, NodesWatchdog};

/// The instant `age` before now. Errors instead of wrapping when `age` reaches
/// past the earliest representable time.
pub(crate) fn cutoff(age: chrono::Duration) -> Result<DateTime<Utc>> {
    Utc::now()
        .checked_sub_signed(age)
        .ok_or_else(|| SchedulerError::Config(format!("age {age} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_is_in_the_past() {
        let before = Utc::now();
        let at = cutoff(chrono::Duration::hours(2)).unwrap();
        assert!(at <= before - chrono::Duration::hours(2) + chrono::Duration::seconds(1));
        assert!(at < before);
    }

    #[test]
    fn cutoff_overflow_is_a_config_error() {
        assert!(matches!(
            cutoff(chrono::Duration::MAX),
            Err(SchedulerError::Config(_))
        ));
    }
}
