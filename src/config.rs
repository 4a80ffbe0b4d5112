//! Scheduler configuration loaded from `opal-scheduler.toml`.
//!
//! Missing keys fall back to defaults, and a missing file yields an all-default
//! configuration. `OPAL_MONGO_URL` and `OPAL_STORAGE_PASSWORD` take precedence
//! over the file.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::SchedulerError;
use crate::state_machine::ExecutorFailurePolicy;

pub const DEFAULT_CONFIG_PATH: &str = "opal-scheduler.toml";

/// Ceiling for the hour-based job thresholds (ten years).
pub const MAX_JOB_AGE_HOURS: u64 = 87_600;
/// Ceiling for node staleness (thirty days).
pub const MAX_NODE_STALENESS_SECS: u64 = 2_592_000;
/// Ceiling for the executor failure window (ten years).
pub const MAX_FAILURE_WINDOW_DAYS: i64 = 3_650;

/// Top-level configuration, passed by value to every component.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_mongo_url")]
    pub mongo_url: String,

    #[serde(default = "default_database")]
    pub database: String,

    /// Gates the archival sweep only; timeout invalidation always runs.
    #[serde(default = "default_true")]
    pub archiving_enabled: bool,

    /// Hours a COMPLETED job stays active before it is archived.
    #[serde(default = "default_jobs_expired_status_time")]
    pub jobs_expired_status_time: u64,

    /// Hours a SCHEDULED or RUNNING job may run before it is requeued.
    #[serde(default = "default_jobs_timingout_time")]
    pub jobs_timingout_time: u64,

    /// Seconds without a report before a BUSY or LOCKED node is declared dead.
    #[serde(default = "default_nodes_expired_status_time")]
    pub nodes_expired_status_time: u64,

    #[serde(default = "default_scheduler_interval_ms")]
    pub scheduler_interval_ms: u64,

    #[serde(default = "default_jobs_watchdog_interval_secs")]
    pub jobs_watchdog_interval_secs: u64,

    #[serde(default = "default_nodes_watchdog_interval_secs")]
    pub nodes_watchdog_interval_secs: u64,

    /// Bound on every worker and object-storage HTTP call.
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Bound on every store call.
    #[serde(default = "default_timeout_secs")]
    pub store_timeout_secs: u64,

    #[serde(default = "default_executor_failure_threshold")]
    pub executor_failure_threshold: usize,

    #[serde(default = "default_executor_failure_window_days")]
    pub executor_failure_window_days: i64,

    /// Free a timed-out cluster job's member nodes when it is requeued,
    /// instead of waiting for node expiry.
    #[serde(default)]
    pub release_resources_on_timeout: bool,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Credentials of the object storage holding job input and output files.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_url")]
    pub url: String,

    #[serde(default = "default_storage_user")]
    pub username: String,

    #[serde(default = "default_storage_user")]
    pub password: String,
}

fn default_mongo_url() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_database() -> String {
    "opal".to_string()
}

fn default_true() -> bool {
    true
}

// 30 days.
fn default_jobs_expired_status_time() -> u64 {
    720
}

fn default_jobs_timingout_time() -> u64 {
    24
}

fn default_nodes_expired_status_time() -> u64 {
    10
}

fn default_scheduler_interval_ms() -> u64 {
    1000
}

fn default_jobs_watchdog_interval_secs() -> u64 {
    1800
}

fn default_nodes_watchdog_interval_secs() -> u64 {
    60
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_executor_failure_threshold() -> usize {
    3
}

fn default_executor_failure_window_days() -> i64 {
    7
}

fn default_storage_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_storage_user() -> String {
    "root".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: default_storage_url(),
            username: default_storage_user(),
            password: default_storage_user(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mongo_url: default_mongo_url(),
            database: default_database(),
            archiving_enabled: true,
            jobs_expired_status_time: default_jobs_expired_status_time(),
            jobs_timingout_time: default_jobs_timingout_time(),
            nodes_expired_status_time: default_nodes_expired_status_time(),
            scheduler_interval_ms: default_scheduler_interval_ms(),
            jobs_watchdog_interval_secs: default_jobs_watchdog_interval_secs(),
            nodes_watchdog_interval_secs: default_nodes_watchdog_interval_secs(),
            request_timeout_secs: default_timeout_secs(),
            store_timeout_secs: default_timeout_secs(),
            executor_failure_threshold: default_executor_failure_threshold(),
            executor_failure_window_days: default_executor_failure_window_days(),
            release_resources_on_timeout: false,
            storage: StorageConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Load from `path`, or defaults if the file does not exist, then apply
    /// environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<SchedulerConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("OPAL_MONGO_URL").filter(|v| !v.is_empty()) {
            self.mongo_url = url;
        }
        if let Some(password) = lookup("OPAL_STORAGE_PASSWORD").filter(|v| !v.is_empty()) {
            self.storage.password = password;
        }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        let positive = [
            ("scheduler_interval_ms", self.scheduler_interval_ms),
            ("jobs_watchdog_interval_secs", self.jobs_watchdog_interval_secs),
            ("nodes_watchdog_interval_secs", self.nodes_watchdog_interval_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("store_timeout_secs", self.store_timeout_secs),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(SchedulerError::Config(format!("{key} must be greater than 0")));
            }
        }
        let bounded = [
            ("jobs_expired_status_time", self.jobs_expired_status_time, MAX_JOB_AGE_HOURS),
            ("jobs_timingout_time", self.jobs_timingout_time, MAX_JOB_AGE_HOURS),
            ("nodes_expired_status_time", self.nodes_expired_status_time, MAX_NODE_STALENESS_SECS),
        ];
        for (key, value, max) in bounded {
            if value > max {
                return Err(SchedulerError::Config(format!("{key} must be at most {max}")));
            }
        }
        if !(1..=MAX_FAILURE_WINDOW_DAYS).contains(&self.executor_failure_window_days) {
            return Err(SchedulerError::Config(format!(
                "executor_failure_window_days must be between 1 and {MAX_FAILURE_WINDOW_DAYS}"
            )));
        }
        if self.database.is_empty() {
            return Err(SchedulerError::Config("database must not be empty".into()));
        }
        Ok(())
    }

    pub fn archive_after(&self) -> Result<chrono::Duration, SchedulerError> {
        age("jobs_expired_status_time", self.jobs_expired_status_time, chrono::Duration::try_hours)
    }

    pub fn job_timeout(&self) -> Result<chrono::Duration, SchedulerError> {
        age("jobs_timingout_time", self.jobs_timingout_time, chrono::Duration::try_hours)
    }

    pub fn node_staleness(&self) -> Result<chrono::Duration, SchedulerError> {
        age("nodes_expired_status_time", self.nodes_expired_status_time, chrono::Duration::try_seconds)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }

    pub fn jobs_watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.jobs_watchdog_interval_secs)
    }

    pub fn nodes_watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.nodes_watchdog_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn failure_policy(&self) -> Result<ExecutorFailurePolicy, SchedulerError> {
        let window = chrono::Duration::try_days(self.executor_failure_window_days)
            .filter(|window| *window > chrono::Duration::zero())
            .ok_or_else(|| {
                SchedulerError::Config("executor_failure_window_days is out of range".into())
            })?;
        Ok(ExecutorFailurePolicy {
            threshold: self.executor_failure_threshold,
            window,
        })
    }
}

fn age(
    key: &str,
    value: u64,
    unit: fn(i64) -> Option<chrono::Duration>,
) -> Result<chrono::Duration, SchedulerError> {
    i64::try_from(value)
        .ok()
        .and_then(unit)
        .ok_or_else(|| SchedulerError::Config(format!("{key} is out of range")))
}
