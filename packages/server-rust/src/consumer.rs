//! Per-partition bus consumer.
//!
//! One worker task per owned partition. It polls the partition topic in
//! bounded batches, maintains the contributor index
//! (collector -> generator -> table -> name -> type), and accumulates
//! changed keys into the shared per-partition bucket the aggregator drains.
//!
//! Messages from a collector that has not been synced yet are ignored; the
//! resource check discovers collectors coming and going and resyncs the
//! affected sub-tree with full-key notifications.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alarmflow_core::uve::UveKey;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::{BusConsumerFactory, BusError, BusRecord};
use crate::reader::UveReader;
use crate::state::{ChangeMap, ContribIndex, InputCounts, PartitionHealth, SharedState, TypeSeen};

const POLL_BATCH: usize = 50;
const POLL_PACING: Duration = Duration::from_millis(100);
const IDLE_PACING: Duration = Duration::from_millis(500);
const RECONNECT_PAUSE: Duration = Duration::from_secs(5);

/// One partition's worker. Constructed by the partition manager and run as
/// a tokio task until the stop signal fires.
pub struct PartitionConsumer {
    partition: u32,
    state: Arc<SharedState>,
    bus: Arc<dyn BusConsumerFactory>,
    reader: Arc<dyn UveReader>,
    health: Arc<PartitionHealth>,
    contents: Arc<Mutex<ContribIndex>>,
    in_counts: Arc<Mutex<InputCounts>>,
    resync: Arc<AtomicBool>,
    stop: watch::Receiver<bool>,
    known_collectors: BTreeSet<String>,
}

impl PartitionConsumer {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        partition: u32,
        state: Arc<SharedState>,
        bus: Arc<dyn BusConsumerFactory>,
        reader: Arc<dyn UveReader>,
        health: Arc<PartitionHealth>,
        contents: Arc<Mutex<ContribIndex>>,
        in_counts: Arc<Mutex<InputCounts>>,
        resync: Arc<AtomicBool>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            partition,
            state,
            bus,
            reader,
            health,
            contents,
            in_counts,
            resync,
            stop,
            known_collectors: BTreeSet::new(),
        }
    }

    pub async fn run(mut self) {
        self.state.ensure_bucket(self.partition);
        info!(partition = self.partition, "partition consumer starting");

        'outer: while !*self.stop.borrow() {
            let mut consumer = match self.bus.create(self.partition) {
                Ok(c) => c,
                Err(BusError::Transient(e)) => {
                    warn!(partition = self.partition, error = %e, "bus connect failed; backing off");
                    self.health.failed.store(true, Ordering::SeqCst);
                    tokio::time::sleep(RECONNECT_PAUSE).await;
                    continue;
                }
                Err(BusError::Fatal(e)) => {
                    error!(partition = self.partition, error = %e, "unrecoverable bus error");
                    self.health.failed.store(true, Ordering::SeqCst);
                    self.state.escalate_fatal("bus connect");
                    break;
                }
            };
            self.health.failed.store(false, Ordering::SeqCst);
            self.health.up.store(true, Ordering::SeqCst);

            loop {
                if *self.stop.borrow() {
                    break 'outer;
                }
                if self.resync.swap(false, Ordering::SeqCst) {
                    info!(partition = self.partition, "rebuilding partition state");
                    self.contents.lock().clear();
                    self.known_collectors.clear();
                }
                match consumer.poll(POLL_BATCH).await {
                    Ok(records) => {
                        let empty = records.is_empty();
                        for record in records {
                            self.handle_record(&record);
                        }
                        self.resource_check().await;
                        tokio::time::sleep(if empty { IDLE_PACING } else { POLL_PACING }).await;
                    }
                    Err(BusError::Transient(e)) => {
                        warn!(partition = self.partition, error = %e, "bus poll failed; reconnecting");
                        self.health.failed.store(true, Ordering::SeqCst);
                        self.health.up.store(false, Ordering::SeqCst);
                        self.contents.lock().clear();
                        self.known_collectors.clear();
                        tokio::time::sleep(RECONNECT_PAUSE).await;
                        continue 'outer;
                    }
                    Err(BusError::Fatal(e)) => {
                        error!(partition = self.partition, error = %e, "unrecoverable bus error");
                        self.health.failed.store(true, Ordering::SeqCst);
                        self.state.escalate_fatal("bus poll");
                        break 'outer;
                    }
                }
            }
        }

        self.health.up.store(false, Ordering::SeqCst);
        info!(partition = self.partition, "partition consumer stopped");
    }

    /// Applies one bus record to the contributor index. Poison records are
    /// logged and skipped; the offset advances regardless.
    fn handle_record(&mut self, record: &BusRecord) {
        self.health.offset.store(record.offset, Ordering::SeqCst);
        let Some((key, typ, generator, collector)) = record.split_key() else {
            warn!(partition = self.partition, key = %record.key, "poison record key; skipping");
            return;
        };
        let Some(uve_key) = UveKey::parse(key) else {
            warn!(partition = self.partition, key, "record key is not table:name; skipping");
            return;
        };

        if !self.known_collectors.contains(collector) {
            // Not synced for this collector yet; the resource check will
            // pick the contribution up wholesale.
            debug!(partition = self.partition, collector, key, "ignoring unsynced collector");
            return;
        }

        metrics::counter!("alarmflow_bus_records_total").increment(1);
        let table = uve_key.table().to_string();
        let name = uve_key.name().to_string();
        {
            let mut index = self.contents.lock();
            let gens = index.entry(collector.to_string()).or_default();
            let names = gens
                .entry(generator.to_string())
                .or_default()
                .entry(table.clone())
                .or_default();

            if record.value.is_none() {
                // Contribution withdrawn.
                if let Some(types) = names.get_mut(&name) {
                    types.remove(typ);
                    if types.is_empty() {
                        names.remove(&name);
                    }
                }
            } else {
                // Payload update or notification-only: both count.
                names
                    .entry(name.clone())
                    .or_default()
                    .entry(typ.to_string())
                    .or_default()
                    .count += 1;
            }
        }
        {
            let mut counts = self.in_counts.lock();
            *counts
                .entry(table)
                .or_default()
                .entry(collector.to_string())
                .or_default()
                .entry(generator.to_string())
                .or_default()
                .entry(typ.to_string())
                .or_insert(0) += 1;
        }

        let mut chg = ChangeMap::new();
        chg.insert(key.to_string(), Some([typ.to_string()].into()));
        self.state.push_changes(self.partition, chg);
    }

    /// Compares the known collectors against the live set and resyncs the
    /// affected sub-trees.
    async fn resource_check(&mut self) {
        let live = self.reader.collectors();
        if live == self.known_collectors {
            return;
        }

        let departed: Vec<String> = self
            .known_collectors
            .difference(&live)
            .cloned()
            .collect();
        for collector in departed {
            info!(partition = self.partition, collector, "collector lost");
            self.stop_collector(&collector);
        }

        let appeared: Vec<String> = live
            .difference(&self.known_collectors)
            .cloned()
            .collect();
        for collector in appeared {
            info!(partition = self.partition, collector, "collector appeared; syncing");
            let population = self
                .reader
                .collector_population(&collector, self.partition, self.state.config.partition_count)
                .await;
            self.start_collector(&collector, &population);
        }

        self.known_collectors = live;
    }

    /// Withdraws a departed collector's contributions, resyncing every key
    /// it touched.
    fn stop_collector(&mut self, collector: &str) {
        let mut chg = ChangeMap::new();
        {
            let mut index = self.contents.lock();
            if let Some(gens) = index.remove(collector) {
                for tables in gens.values() {
                    for (table, names) in tables {
                        for name in names.keys() {
                            chg.insert(format!("{table}:{name}"), None);
                        }
                    }
                }
            }
        }
        if !chg.is_empty() {
            info!(partition = self.partition, collector, keys = chg.len(), "withdrew collector keys");
            self.state.push_changes(self.partition, chg);
        }
    }

    /// Loads a new collector's population into the index and requests a full
    /// resync of every key it contributes.
    fn start_collector(&mut self, collector: &str, population: &crate::reader::CollectorPopulation) {
        let mut chg = ChangeMap::new();
        {
            let mut index = self.contents.lock();
            let gens = index.entry(collector.to_string()).or_default();
            for (generator, keys) in population {
                let gen_entry = gens.entry(generator.clone()).or_default();
                for (key, types) in keys {
                    let Some(uve_key) = UveKey::parse(key) else {
                        continue;
                    };
                    let names = gen_entry.entry(uve_key.table().to_string()).or_default();
                    let type_map = names.entry(uve_key.name().to_string()).or_default();
                    for typ in types {
                        type_map.entry(typ.clone()).or_insert_with(TypeSeen::new);
                    }
                    chg.insert(key.clone(), None);
                }
            }
        }
        info!(partition = self.partition, collector, keys = chg.len(), "synced collector");
        if !chg.is_empty() {
            self.state.push_changes(self.partition, chg);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
