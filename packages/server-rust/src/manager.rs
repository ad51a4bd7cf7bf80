//! Partition ownership management.
//!
//! The rendezvous assigner decides which partitions this member owns; the
//! manager diffs each new owned set against the running workers and starts
//! or stops partition consumers accordingly.
//!
//! Acquire: clear any stale store sub-tree, stamp a fresh epoch, spawn the
//! consumer, wait (bounded) for its change bucket to appear. Release:
//! signal the consumer, join with a bounded timeout (then abort), and queue
//! the partition for aggregator cleanup, which drops caches, withdraws its
//! alarms and clears the store sub-tree.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alarmflow_core::partition::PartitionAssigner;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::bus::BusConsumerFactory;
use crate::consumer::PartitionConsumer;
use crate::reader::UveReader;
use crate::state::{now_micros, ContribIndex, InputCounts, PartitionHealth, SharedState, WorkerHandle};
use crate::store::AggStoreClient;

pub struct PartitionManager {
    state: Arc<SharedState>,
    store: Arc<AggStoreClient>,
    bus: Arc<dyn BusConsumerFactory>,
    reader: Arc<dyn UveReader>,
    assigner: Mutex<PartitionAssigner>,
}

impl PartitionManager {
    #[must_use]
    pub fn new(
        state: Arc<SharedState>,
        store: Arc<AggStoreClient>,
        bus: Arc<dyn BusConsumerFactory>,
        reader: Arc<dyn UveReader>,
    ) -> Self {
        let assigner = PartitionAssigner::new(
            state.config.member_id(),
            state.config.partition_count,
        );
        Self {
            state,
            store,
            bus,
            reader,
            assigner: Mutex::new(assigner),
        }
    }

    /// Applies a new membership view from the discovery feed.
    pub async fn update_membership(&self, members: Vec<String>) {
        if self.state.manual_ownership.load(Ordering::SeqCst) {
            info!(?members, "membership callback ignored (manual ownership)");
            return;
        }
        let (changed, owned) = {
            let mut assigner = self.assigner.lock();
            let changed = assigner.set_members(members);
            (changed, assigner.owned())
        };
        if !changed {
            return;
        }
        let current: BTreeSet<u32> = self.state.workers.lock().keys().copied().collect();
        let add: BTreeSet<u32> = owned.difference(&current).copied().collect();
        let del: BTreeSet<u32> = current.difference(&owned).copied().collect();
        info!(new = ?owned, old = ?current, "partition ownership changed");

        if !add.is_empty() && !self.partition_change(&add, true).await {
            error!(parts = ?add, "partition acquire failed");
        }
        if !del.is_empty() && !self.partition_change(&del, false).await {
            // A failed release means state we no longer own may linger;
            // the supervisor restart path is safer than limping on.
            error!(parts = ?del, "partition release failed");
        }
    }

    /// Acquires or releases a set of partitions. Returns overall success.
    pub async fn partition_change(&self, parts: &BTreeSet<u32>, acquire: bool) -> bool {
        if acquire {
            self.acquire(parts).await
        } else {
            self.release(parts).await
        }
    }

    async fn acquire(&self, parts: &BTreeSet<u32>) -> bool {
        {
            let workers = self.state.workers.lock();
            let dup: Vec<u32> = parts.iter().filter(|p| workers.contains_key(p)).copied().collect();
            if !dup.is_empty() {
                warn!(?dup, "duplicate partition acquire");
                return false;
            }
        }

        for &part in parts {
            let acq = now_micros();
            info!(partition = part, acq, "acquiring partition");
            if let Err(e) = self.store.clear_partition(part, Some(acq)).await {
                // The epoch check on first publish clears again if needed.
                warn!(partition = part, error = %e, "stale sub-tree clear failed");
            }

            let health = Arc::new(PartitionHealth::new(acq));
            let contents = Arc::new(Mutex::new(ContribIndex::new()));
            let in_counts = Arc::new(Mutex::new(InputCounts::new()));
            let resync = Arc::new(AtomicBool::new(false));
            let (stop_tx, stop_rx) = watch::channel(false);
            let consumer = PartitionConsumer::new(
                part,
                Arc::clone(&self.state),
                Arc::clone(&self.bus),
                Arc::clone(&self.reader),
                Arc::clone(&health),
                Arc::clone(&contents),
                Arc::clone(&in_counts),
                Arc::clone(&resync),
                stop_rx,
            );
            let join = tokio::spawn(consumer.run());
            let handle = Arc::new(WorkerHandle::new(
                part, health, contents, in_counts, resync, stop_tx, join,
            ));
            self.state.workers.lock().insert(part, handle);
        }

        // The worker creates its change bucket as it starts.
        let ok = self
            .wait_until(|| parts.iter().all(|p| self.state.has_bucket(*p)))
            .await;
        if !ok {
            warn!(?parts, "partitions did not start in time");
        }
        ok
    }

    async fn release(&self, parts: &BTreeSet<u32>) -> bool {
        {
            let workers = self.state.workers.lock();
            if parts.iter().any(|p| !workers.contains_key(p)) {
                warn!(?parts, "release of partitions not owned");
                return false;
            }
        }

        for &part in parts {
            let Some(handle) = self.state.workers.lock().remove(&part) else {
                continue;
            };
            info!(partition = part, "releasing partition");
            handle.signal_stop();
            let joined = handle
                .join(Duration::from_secs(self.state.config.worker_join_secs))
                .await;
            if !joined {
                warn!(partition = part, "worker killed after join timeout");
            }
            self.state.uveqf.insert(part, handle.acq_time());
        }

        // The aggregator drains the stop queue and removes the buckets.
        let ok = self
            .wait_until(|| parts.iter().all(|p| !self.state.has_bucket(*p)))
            .await;
        if ok {
            info!(?parts, "partition release complete");
        } else {
            warn!(?parts, "partitions did not stop in time");
        }
        ok
    }

    async fn wait_until(&self, cond: impl Fn() -> bool) -> bool {
        let deadline = Duration::from_secs(self.state.config.partition_wait_secs);
        let started = std::time::Instant::now();
        while started.elapsed() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        cond()
    }

    /// Currently owned partitions.
    #[must_use]
    pub fn owned(&self) -> BTreeSet<u32> {
        self.state.workers.lock().keys().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use parking_lot::RwLock;
    use serde_json::json;

    use super::*;
    use crate::aggregator::Aggregator;
    use crate::alarms::RuleRegistry;
    use crate::bus::MemoryBus;
    use crate::config::Config;
    use crate::reader::MemoryUveReader;
    use crate::store::{MemoryStoreCluster, StoreConnector};

    struct Fixture {
        state: Arc<SharedState>,
        manager: PartitionManager,
        aggregator: Arc<Aggregator>,
        store: Arc<AggStoreClient>,
        _bus: Arc<MemoryBus>,
        reader: Arc<MemoryUveReader>,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(Config {
            partition_count: 4,
            partition_wait_secs: 5,
            worker_join_secs: 2,
            ..Config::default()
        });
        let state = Arc::new(SharedState::new(Arc::clone(&config)));
        let cluster = Arc::new(MemoryStoreCluster::new());
        let store = Arc::new(AggStoreClient::new(
            vec!["a:1".to_string()],
            Arc::clone(&cluster) as Arc<dyn StoreConnector>,
            config.module_id.clone(),
            config.instance_id.clone(),
            config.max_out_rows,
        ));
        let bus = Arc::new(MemoryBus::new());
        let reader = Arc::new(MemoryUveReader::new());
        let registry = Arc::new(RwLock::new(RuleRegistry::new()));
        let changes = Arc::new(Mutex::new(HashMap::<String, HashSet<String>>::new()));
        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&state),
            Arc::clone(&store),
            Arc::clone(&reader) as Arc<dyn UveReader>,
            registry,
            changes,
        ));
        let manager = PartitionManager::new(
            Arc::clone(&state),
            Arc::clone(&store),
            Arc::new(Arc::clone(&bus)),
            Arc::clone(&reader) as Arc<dyn UveReader>,
        );
        Fixture {
            state,
            manager,
            aggregator,
            store,
            _bus: bus,
            reader,
        }
    }

    #[tokio::test]
    async fn acquire_starts_workers_and_stamps_epochs() {
        let f = fixture();
        let parts: BTreeSet<u32> = [0, 1].into();
        assert!(f.manager.partition_change(&parts, true).await);

        assert_eq!(f.manager.owned(), parts);
        for p in [0, 1] {
            assert!(f.state.has_bucket(p));
            let epoch = f.store.epoch_of(p).await.unwrap().unwrap();
            assert!(epoch > 0);
        }

        // Re-acquiring an owned partition is refused.
        assert!(!f.manager.partition_change(&[0u32].into(), true).await);
    }

    #[tokio::test]
    async fn release_queues_cleanup_for_aggregator() {
        let f = fixture();
        let parts: BTreeSet<u32> = [2].into();
        assert!(f.manager.partition_change(&parts, true).await);

        // Seed some aggregated data under the partition's epoch.
        let epoch = f.state.worker(2).unwrap().acq_time();
        f.store
            .publish_batch(
                2,
                epoch,
                &[crate::store::OutputRow {
                    key: "t:k".to_string(),
                    typ: Some("UveX".to_string()),
                    val: Some(json!({"a": 1})),
                }],
            )
            .await
            .unwrap();

        // Drive the aggregator alongside the release.
        let agg = Arc::clone(&f.aggregator);
        let drainer = tokio::spawn(async move {
            for _ in 0..50 {
                let _ = agg.run_cycle().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        assert!(f.manager.partition_change(&parts, false).await);
        drainer.abort();

        assert!(f.manager.owned().is_empty());
        assert!(f.store.partition_keys(2).await.unwrap().is_empty());
        assert!(!f.state.has_bucket(2));
    }

    #[tokio::test]
    async fn membership_diff_moves_partitions() {
        let f = fixture();
        let me = f.state.config.member_id();

        // Drain the stop queue continuously, like the running service does.
        let agg = Arc::clone(&f.aggregator);
        let drainer = tokio::spawn(async move {
            loop {
                let _ = agg.run_cycle().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        f.manager.update_membership(vec![me.clone()]).await;
        assert_eq!(f.manager.owned().len(), 4);

        // Another member takes over entirely; everything is released.
        f.manager
            .update_membership(vec!["10.0.0.9:0".to_string()])
            .await;
        assert!(f.manager.owned().is_empty());

        // Released partitions have empty sub-trees.
        for p in 0..4u32 {
            assert!(f.store.partition_keys(p).await.unwrap().is_empty());
            assert!(!f.state.has_bucket(p));
        }
        drainer.abort();
    }

    #[tokio::test]
    async fn manual_ownership_disables_callbacks() {
        let f = fixture();
        f.state.manual_ownership.store(true, Ordering::SeqCst);
        f.manager
            .update_membership(vec![f.state.config.member_id()])
            .await;
        assert!(f.manager.owned().is_empty());
    }

    #[tokio::test]
    async fn release_of_unowned_partition_is_refused() {
        let f = fixture();
        assert!(!f.manager.partition_change(&[3u32].into(), false).await);
        let _ = &f.reader;
    }
}
