//! Service wiring: builds the shared state and components from a [`Config`]
//! and the external seams, spawns the long-lived tasks, and handles signals
//! and administrative requests.
//!
//! Long-lived tasks: the aggregation loop, the config feed, the membership
//! watcher, the bus health probe, and the periodic stats reporter; plus one
//! consumer task per owned partition managed by the [`PartitionManager`].

use std::collections::{HashMap, HashSet};
use std::hash::BuildHasher;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use alarmflow_core::partition::partition_of;
use alarmflow_core::uve::{UveKey, ALARMS_TYPE};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::aggregator::Aggregator;
use crate::alarms::RuleRegistry;
use crate::bus::{BusConsumerFactory, BusProducer};
use crate::config::Config;
use crate::configfeed::{ConfigFeed, ConfigUpdate};
use crate::introspect::{self, AlarmAckRequest, AlarmAckResponse};
use crate::manager::PartitionManager;
use crate::reader::UveReader;
use crate::state::SharedState;
use crate::store::{AggStoreClient, OutputRow, StoreConnector};

/// Sentinel topic the health probe produces to.
pub const HEALTH_CHECK_TOPIC: &str = "HEALTH_CHECK_TOPIC";

const HEALTH_FLUSH_TIMEOUT: Duration = Duration::from_secs(20);
const STATS_PERIOD: Duration = Duration::from_secs(60);

/// External collaborators the service is built on.
pub struct Seams {
    pub bus_factory: Arc<dyn BusConsumerFactory>,
    pub bus_producer: Arc<dyn BusProducer>,
    pub store_connector: Arc<dyn StoreConnector>,
    pub reader: Arc<dyn UveReader>,
}

pub struct Controller {
    pub state: Arc<SharedState>,
    pub store: Arc<AggStoreClient>,
    pub manager: Arc<PartitionManager>,
    pub aggregator: Arc<Aggregator>,
    pub registry: Arc<RwLock<RuleRegistry>>,
    config_changes: Arc<Mutex<HashMap<String, HashSet<String>>>>,
    bus_producer: Arc<dyn BusProducer>,
    config_tx: mpsc::Sender<ConfigUpdate>,
    config_rx: Mutex<Option<mpsc::Receiver<ConfigUpdate>>>,
    membership_tx: mpsc::Sender<Vec<String>>,
    membership_rx: Mutex<Option<mpsc::Receiver<Vec<String>>>>,
    shutdown_tx: watch::Sender<bool>,
    brokers_checksum: std::sync::atomic::AtomicU64,
}

impl Controller {
    #[must_use]
    pub fn new(config: Config, seams: Seams) -> Arc<Self> {
        let config = Arc::new(config);
        let state = Arc::new(SharedState::new(Arc::clone(&config)));
        let store = Arc::new(AggStoreClient::new(
            config.store_endpoints.clone(),
            seams.store_connector,
            config.module_id.clone(),
            config.instance_id.clone(),
            config.max_out_rows,
        ));
        let registry = Arc::new(RwLock::new(RuleRegistry::new()));
        let config_changes = Arc::new(Mutex::new(HashMap::<String, HashSet<String>>::new()));
        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&state),
            Arc::clone(&store),
            Arc::clone(&seams.reader),
            Arc::clone(&registry),
            Arc::clone(&config_changes),
        ));
        let manager = Arc::new(PartitionManager::new(
            Arc::clone(&state),
            Arc::clone(&store),
            Arc::clone(&seams.bus_factory),
            Arc::clone(&seams.reader),
        ));
        let (config_tx, config_rx) = mpsc::channel(64);
        let (membership_tx, membership_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            state,
            store,
            manager,
            aggregator,
            registry,
            config_changes,
            bus_producer: seams.bus_producer,
            config_tx,
            config_rx: Mutex::new(Some(config_rx)),
            membership_tx,
            membership_rx: Mutex::new(Some(membership_rx)),
            shutdown_tx,
            brokers_checksum: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Sender for alarm-config deltas (the rule-source adapter's output).
    #[must_use]
    pub fn config_sender(&self) -> mpsc::Sender<ConfigUpdate> {
        self.config_tx.clone()
    }

    /// Sender for membership views (the discovery adapter's output).
    #[must_use]
    pub fn membership_sender(&self) -> mpsc::Sender<Vec<String>> {
        self.membership_tx.clone()
    }

    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Spawns the long-lived tasks.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Aggregation loop; a timer-index corruption ends the process.
        {
            let aggregator = Arc::clone(&self.aggregator);
            let rx = self.shutdown_tx.subscribe();
            let shutdown = self.shutdown_tx.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = aggregator.run(rx).await {
                    error!(error = %e, "aggregation loop aborted; shutting down");
                    let _ = shutdown.send(true);
                }
            }));
        }

        // Config feed.
        if let Some(rx) = self.config_rx.lock().take() {
            let feed = ConfigFeed::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.config_changes),
                rx,
            );
            let shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(feed.run(shutdown)));
        }

        // Membership watcher.
        if let Some(mut rx) = self.membership_rx.lock().take() {
            let manager = Arc::clone(&self.manager);
            let mut shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        members = rx.recv() => match members {
                            Some(members) => manager.update_membership(members).await,
                            None => break,
                        },
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // Bus health probe.
        {
            let producer = Arc::clone(&self.bus_producer);
            let config = Arc::clone(&self.state.config);
            let shutdown_tx = self.shutdown_tx.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_secs(config.health_probe_initial_secs)) => {}
                    _ = shutdown.changed() => return,
                }
                loop {
                    if let Err(e) = probe_once(producer.as_ref()).await {
                        error!(error = %e, "bus health probe failed; shutting down");
                        let _ = shutdown_tx.send(true);
                        return;
                    }
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_secs(config.health_probe_interval_secs)) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }));
        }

        // Periodic stats reporter.
        {
            let state = Arc::clone(&self.state);
            let mut shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(STATS_PERIOD) => {}
                        _ = shutdown.changed() => break,
                    }
                    report_stats(&state);
                }
            }));
        }

        // Fatal-condition watchdog.
        {
            let state = Arc::clone(&self.state);
            let shutdown_tx = self.shutdown_tx.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_millis(500)) => {}
                        _ = shutdown.changed() => break,
                    }
                    if state.fatal.load(Ordering::SeqCst) {
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                }
            }));
        }

        handles
    }

    /// Runs until SIGTERM or an internal shutdown, then stops gracefully.
    /// Returns the process exit code.
    pub async fn run(self: &Arc<Self>) -> i32 {
        let handles = self.spawn();

        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "cannot install SIGTERM handler");
                    return 1;
                }
            };
        let mut sighup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "cannot install SIGHUP handler");
                    return 1;
                }
            };
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received; stopping");
                    break;
                }
                _ = sighup.recv() => self.reshuffle_brokers(),
                _ = shutdown.changed() => {
                    info!("internal shutdown requested");
                    break;
                }
            }
        }

        self.stop().await;
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
        }
        2
    }

    /// Graceful stop: release every owned partition, then signal all tasks.
    pub async fn stop(&self) {
        let owned = self.manager.owned();
        if !owned.is_empty() {
            info!(?owned, "releasing owned partitions");
            if !self.manager.partition_change(&owned, false).await {
                warn!("partition release incomplete during shutdown");
            }
        }
        self.trigger_shutdown();
    }

    /// SIGHUP: re-read and reshuffle the bus bootstrap endpoints. The
    /// shuffle happens even when the list is unchanged, to rebalance load.
    pub fn reshuffle_brokers(&self) {
        let mut brokers = self.state.config.bus_brokers.clone();
        let checksum = ahash::RandomState::with_seeds(7, 11, 13, 17).hash_one(brokers.join(","));
        let previous = self.brokers_checksum.swap(checksum, Ordering::SeqCst);
        if previous != 0 && previous != checksum {
            info!("bus bootstrap list changed");
        }
        brokers.shuffle(&mut rand::rng());
        info!(?brokers, "bus bootstrap list reshuffled");
        self.state.bus_brokers.store(Arc::new(brokers));
    }

    // -----------------------------------------------------------------------
    // Administrative surface
    // -----------------------------------------------------------------------

    /// Forces partition acquire/release, disabling membership callbacks.
    pub async fn handle_partition_ownership(&self, partition: u32, acquire: bool) -> bool {
        info!(partition, acquire, "manual partition ownership request");
        self.state.manual_ownership.store(true, Ordering::SeqCst);
        self.manager
            .partition_change(&[partition].into(), acquire)
            .await
    }

    #[must_use]
    pub fn handle_partition_status(&self, partition: i64) -> Vec<introspect::PartitionStatusResp> {
        introspect::partition_status(&self.state, partition)
    }

    #[must_use]
    pub fn handle_uve_table_alarm(&self, table: &str) -> Vec<introspect::UveTableAlarmResp> {
        introspect::uve_table_alarm(&self.state, table)
    }

    #[must_use]
    pub fn handle_uve_table_info(&self, partition: u32) -> introspect::UveTableInfoResp {
        introspect::uve_table_info(&self.state, partition)
    }

    #[must_use]
    pub fn handle_uve_table_perf(&self, table: &str) -> Vec<introspect::UveTablePerfResp> {
        introspect::uve_table_perf(&self.state, table)
    }

    #[must_use]
    pub fn handle_alarm_config(&self, name: Option<&str>) -> introspect::AlarmConfigResp {
        introspect::alarm_configs(&self.registry.read(), name)
    }

    /// Acknowledges an alarm and republishes the key's alarm set on first
    /// ack.
    pub async fn handle_alarm_ack(&self, req: &AlarmAckRequest) -> AlarmAckResponse {
        let (resp, republish) = introspect::alarm_ack(&self.state, req);
        if republish {
            let key_str = format!("{}:{}", req.table, req.name);
            if let Some(key) = UveKey::parse(&key_str) {
                let part = partition_of(&key_str, self.state.config.partition_count);
                if let Some(worker) = self.state.worker(part) {
                    let payload = self.state.alarms.lock().alarms_payload(&key);
                    let row = OutputRow {
                        key: key_str,
                        typ: Some(ALARMS_TYPE.to_string()),
                        val: payload.and_then(|p| serde_json::to_value(p).ok()),
                    };
                    if let Err(e) = self
                        .store
                        .publish_batch(part, worker.acq_time(), &[row])
                        .await
                    {
                        warn!(error = %e, "ack republish failed");
                    }
                }
            }
        }
        resp
    }
}

async fn probe_once(producer: &dyn BusProducer) -> Result<(), crate::bus::BusError> {
    producer.produce(HEALTH_CHECK_TOPIC, b"live..").await?;
    producer.flush(HEALTH_FLUSH_TIMEOUT).await?;
    info!("bus health probe acknowledged");
    Ok(())
}

fn report_stats(state: &Arc<SharedState>) {
    let period = state.stats.lock().collect();
    for (part, tables) in &period.uve_out {
        for (table, types) in tables {
            for (typ, counts) in types {
                info!(
                    partition = part,
                    table,
                    typ,
                    add = counts.add,
                    change = counts.change,
                    remove = counts.remove,
                    "uve output stats"
                );
            }
        }
    }
    for (part, tables) in &period.alarm_ops {
        for (table, alarms) in tables {
            for (alarm, counts) in alarms {
                info!(
                    partition = part,
                    table,
                    alarm,
                    set = counts.set,
                    reset = counts.reset,
                    "alarm stats"
                );
            }
        }
    }
    // Input-side counters, drained from each worker.
    let workers: Vec<_> = state.workers.lock().values().cloned().collect();
    for worker in workers {
        let drained = std::mem::take(&mut *worker.in_counts.lock());
        for (table, colls) in drained {
            for (collector, gens) in colls {
                for (generator, types) in gens {
                    for (typ, count) in types {
                        info!(
                            partition = worker.partition,
                            table, collector, generator, typ, count,
                            "uve input stats"
                        );
                    }
                }
            }
        }
    }
    let active: usize = {
        let alarms = state.alarms.lock();
        alarms
            .tables()
            .iter()
            .map(|t| alarms.snapshots(t).len())
            .sum()
    };
    metrics::gauge!("alarmflow_active_alarm_records").set(active as f64);
}
