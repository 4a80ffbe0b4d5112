use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info};

use super::cutoff;
use crate::error::Result;
use crate::notify::AdminNotifier;
use crate::runtime::{Outcome, Sweep, TickSummary, combine};
use crate::state_machine::{WorkerAddr, WorkerNode, WorkerStatus};
use crate::store::{Store, WorkerFilter, WorkerPatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    /// BUSY or LOCKED with a stale report, now DEAD and locked.
    Expired,
    /// DEAD, now EXCLUDED and locked for good.
    Excluded,
    Contended,
}

impl Outcome for NodeOutcome {
    fn contended(&self) -> bool {
        matches!(self, NodeOutcome::Contended)
    }
}

/// Takes silent and dead nodes out of the pool.
pub struct NodesWatchdog<S, N> {
    store: Arc<S>,
    notifier: Arc<N>,
    staleness: chrono::Duration,
}

impl<S: Store, N: AdminNotifier> NodesWatchdog<S, N> {
    pub fn new(store: Arc<S>, notifier: Arc<N>, staleness: chrono::Duration) -> Self {
        Self {
            store,
            notifier,
            staleness,
        }
    }

    /// Declare DEAD every unlocked BUSY or LOCKED node that has not reported
    /// within the staleness window. The node stays locked.
    pub async fn expire_tick(&self) -> Result<TickSummary> {
        let candidates = WorkerFilter::claimable(&[WorkerStatus::Busy, WorkerStatus::Locked])
            .updated_before(cutoff(self.staleness)?);
        let patch = WorkerPatch::new(WorkerStatus::Dead, true);
        self.sweep(&candidates, &patch, NodeOutcome::Expired).await
    }

    /// Move every DEAD node to EXCLUDED and notify the administrator.
    ///
    /// Nodes declared dead here or by the executor failure policy are
    /// already locked, so the claim is the DEAD → EXCLUDED status change
    /// itself rather than the lock.
    pub async fn exclude_tick(&self) -> Result<TickSummary> {
        let candidates = WorkerFilter::in_status(&[WorkerStatus::Dead]);
        let patch = WorkerPatch::new(WorkerStatus::Excluded, true);
        self.sweep(&candidates, &patch, NodeOutcome::Excluded).await
    }

    async fn sweep(
        &self,
        candidates: &WorkerFilter,
        patch: &WorkerPatch,
        done: NodeOutcome,
    ) -> Result<TickSummary> {
        let nodes = self.store.find_workers(candidates).await?;
        let results = join_all(nodes.iter().map(|node| async move {
            self.transition(node, candidates, patch, done)
                .await
                .inspect_err(|e| error!(node = %node.addr(), error = %e, "node update failed"))
        }))
        .await;
        Ok(TickSummary::tally(nodes.len(), &results))
    }

    async fn transition(
        &self,
        node: &WorkerNode,
        candidates: &WorkerFilter,
        patch: &WorkerPatch,
        done: NodeOutcome,
    ) -> Result<NodeOutcome> {
        let addr = node.addr();
        let claim = candidates.clone().with_addr(addr.clone());
        if self.store.update_worker(&claim, patch).await?.is_none() {
            debug!(node = %addr, "node already updated by another actor");
            return Ok(NodeOutcome::Contended);
        }
        match done {
            NodeOutcome::Excluded => self.excluded(&addr),
            _ => info!(node = %addr, "expired node set to DEAD"),
        }
        Ok(done)
    }

    fn excluded(&self, addr: &WorkerAddr) {
        info!(node = %addr, "dead node excluded");
        self.notifier.node_excluded(addr);
    }
}

impl<S: Store, N: AdminNotifier> Sweep for NodesWatchdog<S, N> {
    fn name(&self) -> &'static str {
        "nodes-watchdog"
    }

    /// Exclusion runs before expiry, so a node expired in this tick is
    /// excluded by the next one.
    async fn tick(&self) -> Result<TickSummary> {
        combine([self.exclude_tick().await, self.expire_tick().await])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;
    use crate::state_machine::JobType;
    use crate::store::MemoryStore;

    #[derive(Default)]
    struct MockNotifier {
        excluded: Mutex<Vec<WorkerAddr>>,
    }

    impl AdminNotifier for MockNotifier {
        fn node_excluded(&self, addr: &WorkerAddr) {
            self.excluded.lock().unwrap().push(addr.clone());
        }
    }

    fn watchdog() -> (Arc<MemoryStore>, Arc<MockNotifier>, NodesWatchdog<MemoryStore, MockNotifier>) {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(MockNotifier::default());
        let watchdog = NodesWatchdog::new(
            Arc::clone(&store),
            Arc::clone(&notifier),
            chrono::Duration::seconds(10),
        );
        (store, notifier, watchdog)
    }

    fn node(port: u16, status: WorkerStatus, age_secs: i64) -> WorkerNode {
        let mut node = WorkerNode::new(WorkerAddr::new("10.0.0.1", port), JobType::R);
        node.status = status;
        node.last_update = Utc::now() - chrono::Duration::seconds(age_secs);
        node
    }

    #[tokio::test]
    async fn only_stale_busy_or_locked_nodes_expire() {
        let (store, _, watchdog) = watchdog();
        store.insert_worker(node(1, WorkerStatus::Busy, 60));
        store.insert_worker(node(2, WorkerStatus::Locked, 60));
        store.insert_worker(node(3, WorkerStatus::Busy, 1));
        store.insert_worker(node(4, WorkerStatus::Idle, 60));

        let summary = watchdog.expire_tick().await.unwrap();
        assert_eq!(summary.completed, 2);

        let status = |port| store.worker(&WorkerAddr::new("10.0.0.1", port)).unwrap();
        assert_eq!(status(1).status, WorkerStatus::Dead);
        assert!(status(1).status_lock);
        assert_eq!(status(2).status, WorkerStatus::Dead);
        assert_eq!(status(3).status, WorkerStatus::Busy);
        assert_eq!(status(4).status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn dead_node_is_excluded_once() {
        let (store, notifier, watchdog) = watchdog();
        store.insert_worker(node(1, WorkerStatus::Dead, 0));

        assert_eq!(watchdog.exclude_tick().await.unwrap().completed, 1);
        assert_eq!(watchdog.exclude_tick().await.unwrap().candidates, 0);

        let excluded = store.worker(&WorkerAddr::new("10.0.0.1", 1)).unwrap();
        assert_eq!(excluded.status, WorkerStatus::Excluded);
        assert!(excluded.status_lock);
        assert_eq!(notifier.excluded.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_node_is_excluded_on_next_tick() {
        let (store, notifier, watchdog) = watchdog();
        let addr = WorkerAddr::new("10.0.0.1", 1);
        store.insert_worker(node(1, WorkerStatus::Busy, 60));

        watchdog.tick().await.unwrap();
        assert_eq!(store.worker(&addr).unwrap().status, WorkerStatus::Dead);
        assert!(notifier.excluded.lock().unwrap().is_empty());

        watchdog.tick().await.unwrap();
        assert_eq!(store.worker(&addr).unwrap().status, WorkerStatus::Excluded);
        assert_eq!(*notifier.excluded.lock().unwrap(), vec![addr]);
    }
}
