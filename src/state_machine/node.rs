use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobType;

/// Worker availability as recorded in the status collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Locked,
    Dead,
    Excluded,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            WorkerStatus::Idle => "IDLE",
            WorkerStatus::Busy => "BUSY",
            WorkerStatus::Locked => "LOCKED",
            WorkerStatus::Dead => "DEAD",
            WorkerStatus::Excluded => "EXCLUDED",
        };
        write!(f, "{tag}")
    }
}

/// Network identity of a worker; the natural key of the status collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerAddr {
    pub ip: String,
    pub port: u16,
}

impl WorkerAddr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for WorkerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Snapshot of a cluster member embedded in its parent's record.
///
/// The authoritative state lives in the member's own status record; this copy
/// is only as fresh as the parent's last report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMember {
    pub ip: String,
    pub port: u16,
    pub status_lock: bool,
}

impl ClusterMember {
    pub fn addr(&self) -> WorkerAddr {
        WorkerAddr::new(self.ip.clone(), self.port)
    }
}

/// A compute node as stored in the status collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerNode {
    pub ip: String,
    pub port: u16,
    pub status: WorkerStatus,
    pub status_lock: bool,
    pub compute_type: JobType,
    /// Sub-nodes reserved together with this node, keyed by cluster kind.
    #[serde(default)]
    pub clusters: BTreeMap<String, Vec<ClusterMember>>,
    pub last_update: DateTime<Utc>,
}

impl WorkerNode {
    /// An idle, unlocked node that just reported in.
    pub fn new(addr: WorkerAddr, compute_type: JobType) -> Self {
        Self {
            ip: addr.ip,
            port: addr.port,
            status: WorkerStatus::Idle,
            status_lock: false,
            compute_type,
            clusters: BTreeMap::new(),
            last_update: Utc::now(),
        }
    }

    pub fn addr(&self) -> WorkerAddr {
        WorkerAddr::new(self.ip.clone(), self.port)
    }

    pub fn cluster(&self, key: &str) -> &[ClusterMember] {
        self.clusters.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}
