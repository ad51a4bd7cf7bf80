//! State shared between the partition workers, the aggregation loop, the
//! partition manager and the introspect handlers.
//!
//! Workers and the aggregator run as cooperative tokio tasks; the shared
//! structures are guarded by short, never-held-across-await locks.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alarmflow_core::delta::TypeDelta;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::alarms::AlarmTable;
use crate::config::Config;
use crate::stats::ServerStats;

/// Pending changes for one partition: key -> changed types, or `None` for a
/// full resync of the key.
pub type ChangeMap = HashMap<String, Option<HashSet<String>>>;

/// One contribution's bookkeeping in the per-partition index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSeen {
    pub count: u64,
    pub agg_uuid: Uuid,
}

impl TypeSeen {
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: 0,
            agg_uuid: Uuid::new_v4(),
        }
    }
}

impl Default for TypeSeen {
    fn default() -> Self {
        Self::new()
    }
}

/// Contributor index of one partition:
/// collector -> generator -> table -> name -> type.
pub type ContribIndex =
    BTreeMap<String, BTreeMap<String, BTreeMap<String, BTreeMap<String, BTreeMap<String, TypeSeen>>>>>;

/// Input-notification counters: table -> collector -> generator -> type.
pub type InputCounts = HashMap<String, HashMap<String, HashMap<String, HashMap<String, u64>>>>;

/// Liveness and progress of one partition worker.
#[derive(Debug)]
pub struct PartitionHealth {
    pub up: AtomicBool,
    pub failed: AtomicBool,
    /// Partition epoch: microseconds at acquisition, reset on store
    /// reconnect.
    pub acq_time_us: AtomicI64,
    pub offset: AtomicI64,
}

impl PartitionHealth {
    #[must_use]
    pub fn new(acq_time_us: i64) -> Self {
        Self {
            up: AtomicBool::new(true),
            failed: AtomicBool::new(false),
            acq_time_us: AtomicI64::new(acq_time_us),
            offset: AtomicI64::new(0),
        }
    }
}

/// Handle the manager keeps for a running partition worker.
pub struct WorkerHandle {
    pub partition: u32,
    pub health: Arc<PartitionHealth>,
    pub contents: Arc<Mutex<ContribIndex>>,
    pub in_counts: Arc<Mutex<InputCounts>>,
    resync: Arc<AtomicBool>,
    stop: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    #[must_use]
    pub fn new(
        partition: u32,
        health: Arc<PartitionHealth>,
        contents: Arc<Mutex<ContribIndex>>,
        in_counts: Arc<Mutex<InputCounts>>,
        resync: Arc<AtomicBool>,
        stop: watch::Sender<bool>,
        join: JoinHandle<()>,
    ) -> Self {
        Self {
            partition,
            health,
            contents,
            in_counts,
            resync,
            stop,
            join: Mutex::new(Some(join)),
        }
    }

    #[must_use]
    pub fn acq_time(&self) -> i64 {
        self.health.acq_time_us.load(Ordering::SeqCst)
    }

    /// Restamps the epoch and asks the worker to rebuild its index from the
    /// collectors (store reconnect path).
    pub fn request_resync(&self, new_acq_us: i64) {
        self.health.acq_time_us.store(new_acq_us, Ordering::SeqCst);
        self.resync.store(true, Ordering::SeqCst);
    }

    /// Signals the worker to exit.
    pub fn signal_stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Joins the worker task; aborts it when the timeout expires.
    pub async fn join(&self, timeout: Duration) -> bool {
        let handle = self.join.lock().take();
        let Some(handle) = handle else {
            return true;
        };
        let abort = handle.abort_handle();
        match tokio::time::timeout(timeout, handle).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(partition = self.partition, "worker join timed out; aborting");
                abort.abort();
                false
            }
        }
    }
}

/// Everything the long-lived tasks share.
pub struct SharedState {
    pub config: Arc<Config>,
    /// Per-partition changed-key buckets, written by the consumers and
    /// drained by the aggregator.
    pub uveq: DashMap<u32, Arc<Mutex<ChangeMap>>>,
    /// Partitions released by the manager, queued for aggregator cleanup.
    /// Value is the epoch they were released under.
    pub uveqf: DashMap<u32, i64>,
    pub workers: Mutex<BTreeMap<u32, Arc<WorkerHandle>>>,
    /// Aggregator caches: partition -> table -> name -> delta tracker.
    pub ptab_info: Mutex<HashMap<u32, HashMap<String, HashMap<String, TypeDelta>>>>,
    pub alarms: Mutex<AlarmTable>,
    pub stats: Mutex<ServerStats>,
    /// Bus bootstrap endpoints, reshuffled on SIGHUP.
    pub bus_brokers: ArcSwap<Vec<String>>,
    /// Set once an introspect request forces ownership; membership callbacks
    /// are ignored from then on.
    pub manual_ownership: AtomicBool,
    /// Set by any task hitting an unrecoverable error; the controller
    /// watchdog turns it into a process exit for the supervisor to restart.
    pub fatal: AtomicBool,
}

impl SharedState {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        let alarms = AlarmTable::new(config.host_ip.clone(), config.introspect_port);
        let brokers = config.bus_brokers.clone();
        Self {
            config,
            uveq: DashMap::new(),
            uveqf: DashMap::new(),
            workers: Mutex::new(BTreeMap::new()),
            ptab_info: Mutex::new(HashMap::new()),
            alarms: Mutex::new(alarms),
            stats: Mutex::new(ServerStats::new()),
            bus_brokers: ArcSwap::from_pointee(brokers),
            manual_ownership: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
        }
    }

    /// Records an unrecoverable condition.
    pub fn escalate_fatal(&self, reason: &str) {
        tracing::error!(reason, "unrecoverable error; requesting process exit");
        self.fatal.store(true, Ordering::SeqCst);
    }

    /// Creates the change bucket for a partition. Its existence is what the
    /// manager waits on during acquisition.
    pub fn ensure_bucket(&self, partition: u32) {
        self.uveq.entry(partition).or_default();
    }

    #[must_use]
    pub fn has_bucket(&self, partition: u32) -> bool {
        self.uveq.contains_key(&partition)
    }

    /// Merges a worker's change notifications into the partition bucket.
    /// A pending full resync absorbs any later type-level change.
    pub fn push_changes(&self, partition: u32, changes: ChangeMap) {
        let bucket = Arc::clone(&self.uveq.entry(partition).or_default());
        let mut map = bucket.lock();
        for (key, types) in changes {
            match types {
                None => {
                    map.insert(key, None);
                }
                Some(types) => match map.get_mut(&key) {
                    Some(Some(existing)) => existing.extend(types),
                    Some(None) => {}
                    None => {
                        map.insert(key, Some(types));
                    }
                },
            }
        }
    }

    #[must_use]
    pub fn worker(&self, partition: u32) -> Option<Arc<WorkerHandle>> {
        self.workers.lock().get(&partition).cloned()
    }

    /// Partitions with a live worker, with their epochs.
    #[must_use]
    pub fn worker_set(&self) -> BTreeMap<u32, i64> {
        self.workers
            .lock()
            .iter()
            .filter(|(_, w)| w.health.up.load(Ordering::SeqCst))
            .map(|(p, w)| (*p, w.acq_time()))
            .collect()
    }
}

/// Microseconds since the epoch; the partition epoch unit.
#[must_use]
pub fn now_micros() -> i64 {
    i64::try_from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_micros()),
    )
    .unwrap_or(i64::MAX)
}

/// The set of collectors currently known to a contributor index.
#[must_use]
pub fn collectors_of(index: &ContribIndex) -> BTreeSet<String> {
    index.keys().cloned().collect()
}
