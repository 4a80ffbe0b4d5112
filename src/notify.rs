use tracing::warn;

use crate::state_machine::WorkerAddr;

/// Receives a message for every node taken out of service for good.
pub trait AdminNotifier: Send + Sync {
    fn node_excluded(&self, addr: &WorkerAddr);
}

/// Writes exclusions to the log at `warn` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl AdminNotifier for LogNotifier {
    fn node_excluded(&self, addr: &WorkerAddr) {
        warn!(
            node = %addr,
            "node {} port {} excluded, operator action required",
            addr.ip,
            addr.port
        );
    }
}
