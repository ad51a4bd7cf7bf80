//! The UVE processing loop.
//!
//! One cooperative task drains the per-partition changed-key buckets the
//! consumers fill: state compression happens here, since repeated updates
//! to one key coalesce in the bucket. Each cycle fetches contributions for
//! the changed keys, merges them into the aggregated view, publishes the
//! type-level delta to the aggregate store under the partition's epoch,
//! re-evaluates alarms against the new view, applies coalesced alarm-config
//! changes, and scans the alarm timer index.
//!
//! The loop runs at a 1 s cadence and degrades to back-to-back cycles when
//! saturated. At most `max_keys_per_cycle` keys are taken per partition per
//! cycle; the rest stay in the bucket.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use alarmflow_core::aggregate::aggregate_uve;
use alarmflow_core::partition::partition_of;
use alarmflow_core::uve::{flatten, UveKey, ALARMS_TYPE};
use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::alarms::{RuleRegistry, TimerError};
use crate::state::{now_micros, ChangeMap, SharedState};
use crate::stats::UveOp;
use crate::store::{AggStoreClient, OutputRow};
use crate::reader::UveReader;

/// Failure of one aggregation cycle.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    /// Timer-index corruption; the process must exit.
    #[error("timer index corrupted: {0}")]
    Fatal(#[from] TimerError),
    /// Store or reader trouble; the cycle is retried after a pause.
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

pub struct Aggregator {
    state: Arc<SharedState>,
    store: Arc<AggStoreClient>,
    reader: Arc<dyn UveReader>,
    registry: Arc<RwLock<RuleRegistry>>,
    /// Coalesced alarm-config changes: scope (table or key) -> alarm names.
    config_changes: Arc<Mutex<HashMap<String, HashSet<String>>>>,
    last_worker_set: Mutex<std::collections::BTreeMap<u32, i64>>,
}

impl Aggregator {
    #[must_use]
    pub fn new(
        state: Arc<SharedState>,
        store: Arc<AggStoreClient>,
        reader: Arc<dyn UveReader>,
        registry: Arc<RwLock<RuleRegistry>>,
        config_changes: Arc<Mutex<HashMap<String, HashSet<String>>>>,
    ) -> Self {
        Self {
            state,
            store,
            reader,
            registry,
            config_changes,
            last_worker_set: Mutex::new(std::collections::BTreeMap::new()),
        }
    }

    /// Runs cycles until shutdown. Returns the timer error when the index
    /// is corrupt, at which point the caller exits the process.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), TimerError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let started = Instant::now();
            match self.run_cycle().await {
                Ok(()) => {}
                Err(CycleError::Fatal(e)) => {
                    error!(error = %e, "alarm timer index corrupted");
                    return Err(e);
                }
                Err(CycleError::Transient(e)) => {
                    warn!(error = %e, "aggregation cycle failed; will retry");
                    self.store.mark_down();
                }
            }
            let elapsed = started.elapsed();
            let cadence = std::time::Duration::from_secs(1);
            if elapsed < cadence {
                tokio::select! {
                    () = tokio::time::sleep(cadence - elapsed) => {}
                    _ = shutdown.changed() => {}
                }
            } else {
                info!("aggregation cycle saturated");
                tokio::task::yield_now().await;
            }
        }
    }

    /// One full pass: released-partition cleanup, store liveness, bucket
    /// processing, config changes, timers, ownership publication.
    pub async fn run_cycle(&self) -> Result<(), CycleError> {
        self.drain_stopped_partitions().await?;

        let fresh = self.store.connected_endpoint().is_none();
        self.store
            .connect()
            .await
            .context("aggregate store unavailable")?;
        let restarted = self
            .store
            .check_restart()
            .await
            .context("store liveness check failed")?;
        if fresh || restarted {
            self.reset_partitions().await?;
        }

        let parts: Vec<u32> = self.state.uveq.iter().map(|e| *e.key()).collect();
        for part in parts {
            let Some(worker) = self.state.worker(part) else {
                continue;
            };
            if worker.health.failed.load(std::sync::atomic::Ordering::SeqCst) {
                warn!(partition = part, "bus worker failed; partition lagging");
            }
            let pending = self.take_pending(part);
            if pending.is_empty() {
                continue;
            }
            debug!(partition = part, keys = pending.len(), "processing changed keys");
            let rows = self.process_partition(part, &pending).await?;
            if !rows.is_empty() {
                let t0 = Instant::now();
                self.store
                    .publish_batch(part, worker.acq_time(), &rows)
                    .await
                    .context("aggregate publish failed")?;
                let us = elapsed_us(t0);
                let mut stats = self.state.stats.lock();
                for row in &rows {
                    if let Some(k) = UveKey::parse(&row.key) {
                        stats.perf(k.table()).record_pub(us / i64::try_from(rows.len()).unwrap_or(1));
                    }
                }
            }
        }

        let changes = std::mem::take(&mut *self.config_changes.lock());
        if !changes.is_empty() {
            self.apply_config_changes(&changes).await?;
        }

        self.run_alarm_timers().await?;
        self.publish_worker_set();
        Ok(())
    }

    /// Takes at most `max_keys_per_cycle` keys out of a partition bucket.
    fn take_pending(&self, partition: u32) -> ChangeMap {
        let Some(bucket) = self.state.uveq.get(&partition).map(|b| Arc::clone(&b)) else {
            return ChangeMap::new();
        };
        let limit = self.state.config.max_keys_per_cycle;
        let mut map = bucket.lock();
        if map.len() <= limit {
            return std::mem::take(&mut *map);
        }
        let keys: Vec<String> = map.keys().take(limit).cloned().collect();
        info!(partition, taken = keys.len(), remain = map.len() - keys.len(), "bucket saturated");
        keys.into_iter()
            .filter_map(|k| map.remove_entry(&k))
            .collect()
    }

    /// Processes one partition's pending keys into output rows. Keys whose
    /// contribution fetch partially failed are requeued and skipped; they
    /// never block the rest.
    async fn process_partition(
        &self,
        partition: u32,
        pending: &ChangeMap,
    ) -> Result<Vec<OutputRow>, CycleError> {
        let mut rows = Vec::new();
        let mut requeue = ChangeMap::new();

        for (key_str, types) in pending {
            let Some(key) = UveKey::parse(key_str) else {
                warn!(key = %key_str, "dropping malformed key");
                continue;
            };
            let filter: Option<BTreeSet<String>> =
                types.as_ref().map(|t| t.iter().cloned().collect());

            let t0 = Instant::now();
            let (failed, contribs) = self.reader.read_uve(key_str, filter.as_ref()).await;
            self.state
                .stats
                .lock()
                .perf(key.table())
                .record_get(elapsed_us(t0));
            if failed {
                warn!(key = %key_str, "contribution fetch failed; requeueing key");
                requeue.insert(key_str.clone(), types.clone());
                continue;
            }

            let agg = aggregate_uve(key_str, &contribs);
            let (empty, alarm_only, local_flat) = {
                let mut ptab = self.state.ptab_info.lock();
                let delta = ptab
                    .entry(partition)
                    .or_default()
                    .entry(key.table().to_string())
                    .or_default()
                    .entry(key.name().to_string())
                    .or_default();

                match &filter {
                    None => {
                        delta.update_full(agg);
                        self.emit_delta_rows(partition, &key, delta, &mut rows);
                    }
                    Some(set) => {
                        for typ in set {
                            delta.update_single(typ, agg.get(typ).cloned());
                            self.emit_delta_rows(partition, &key, delta, &mut rows);
                        }
                    }
                }

                let empty = delta.is_empty();
                let alarm_only =
                    !empty && delta.values().len() == 1 && delta.values().contains_key(ALARMS_TYPE);
                let local_flat = if empty || alarm_only {
                    Value::Null
                } else {
                    let mut obj = serde_json::Map::new();
                    for (typ, val) in delta.values() {
                        obj.insert(typ.clone(), flatten(val));
                    }
                    Value::Object(obj)
                };
                if empty {
                    let tmap = ptab.get_mut(&partition);
                    if let Some(tmap) = tmap {
                        if let Some(names) = tmap.get_mut(key.table()) {
                            names.remove(key.name());
                            if names.is_empty() {
                                tmap.remove(key.table());
                            }
                        }
                    }
                }
                (empty, alarm_only, local_flat)
            };

            if empty {
                info!(key = %key_str, "uve deleted");
                rows.push(OutputRow {
                    key: key_str.clone(),
                    typ: None,
                    val: None,
                });
                // The whole-key removal wipes stored alarms too; the state
                // machines just need tearing down.
                self.state.alarms.lock().clear_key(&key)?;
                continue;
            }
            if alarm_only {
                info!(key = %key_str, "uve has no non-alarm structs");
                if self.state.alarms.lock().clear_key(&key)? {
                    rows.push(self.alarm_row(&key));
                }
                continue;
            }

            let t0 = Instant::now();
            let changed = {
                let registry = self.registry.read();
                let mut alarms = self.state.alarms.lock();
                let mut stats = self.state.stats.lock();
                alarms.examine(
                    partition,
                    &key,
                    &local_flat,
                    &registry,
                    &mut stats,
                    now_micros(),
                )?
            };
            self.state
                .stats
                .lock()
                .perf(key.table())
                .record_call(elapsed_us(t0));
            if changed {
                rows.push(self.alarm_row(&key));
            }
        }

        if !requeue.is_empty() {
            self.state.push_changes(partition, requeue);
        }
        Ok(rows)
    }

    /// Turns the delta sets of the last update into output rows.
    fn emit_delta_rows(
        &self,
        partition: u32,
        key: &UveKey,
        delta: &alarmflow_core::delta::TypeDelta,
        rows: &mut Vec<OutputRow>,
    ) {
        let mut stats = self.state.stats.lock();
        for typ in delta.removed() {
            stats.count_uve_op(partition, key.table(), typ, UveOp::Remove);
            rows.push(OutputRow {
                key: key.as_str().to_string(),
                typ: Some(typ.clone()),
                val: None,
            });
        }
        for typ in delta.changed() {
            stats.count_uve_op(partition, key.table(), typ, UveOp::Change);
            rows.push(OutputRow {
                key: key.as_str().to_string(),
                typ: Some(typ.clone()),
                val: delta.values().get(typ).cloned(),
            });
        }
        for typ in delta.added() {
            stats.count_uve_op(partition, key.table(), typ, UveOp::Add);
            rows.push(OutputRow {
                key: key.as_str().to_string(),
                typ: Some(typ.clone()),
                val: delta.values().get(typ).cloned(),
            });
        }
        metrics::counter!("alarmflow_uve_keys_processed_total").increment(1);
    }

    /// The current alarm row for a key: a value when alarms are publishable,
    /// a type tombstone otherwise.
    fn alarm_row(&self, key: &UveKey) -> OutputRow {
        let payload = self.state.alarms.lock().alarms_payload(key);
        OutputRow {
            key: key.as_str().to_string(),
            typ: Some(ALARMS_TYPE.to_string()),
            val: payload.map(|p| serde_json::to_value(p).unwrap_or(Value::Null)),
        }
    }

    /// Cleanup for partitions released by the manager: drop caches, tear
    /// down their alarms, clear the store sub-tree.
    async fn drain_stopped_partitions(&self) -> Result<(), CycleError> {
        let stopped: Vec<u32> = self.state.uveqf.iter().map(|e| *e.key()).collect();
        for part in stopped {
            info!(partition = part, "stopping uve processing");
            self.forget_partition(part);
            self.store
                .clear_partition(part, None)
                .await
                .context("partition clear failed")?;
            self.state.uveqf.remove(&part);
        }
        Ok(())
    }

    /// Drops the aggregator caches and alarm records of one partition.
    fn forget_partition(&self, partition: u32) {
        self.state.uveq.remove(&partition);
        let keys: Vec<UveKey> = {
            let mut ptab = self.state.ptab_info.lock();
            ptab.remove(&partition)
                .map(|tables| {
                    tables
                        .iter()
                        .flat_map(|(table, names)| {
                            names
                                .keys()
                                .filter_map(|name| UveKey::parse(&format!("{table}:{name}")))
                                .collect::<Vec<_>>()
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        let mut alarms = self.state.alarms.lock();
        for key in &keys {
            alarms.drop_key(key);
        }
        self.state.stats.lock().drop_partition(partition);
        if !keys.is_empty() {
            info!(partition, keys = keys.len(), "withdrew partition uves");
        }
    }

    /// Store reconnect: every worker's epoch restarts and its data is
    /// rewritten from a clean sub-tree.
    async fn reset_partitions(&self) -> Result<(), CycleError> {
        let workers: Vec<(u32, Arc<crate::state::WorkerHandle>)> = self
            .state
            .workers
            .lock()
            .iter()
            .map(|(p, w)| (*p, Arc::clone(w)))
            .collect();
        for (part, worker) in workers {
            let acq = now_micros();
            info!(partition = part, acq, "resetting partition after store reconnect");
            worker.request_resync(acq);
            self.forget_partition(part);
            self.state.ensure_bucket(part);
            self.store
                .clear_partition(part, Some(acq))
                .await
                .context("partition reset failed")?;
        }
        Ok(())
    }

    /// Re-evaluates alarms for every key affected by coalesced config
    /// changes.
    async fn apply_config_changes(
        &self,
        changes: &HashMap<String, HashSet<String>>,
    ) -> Result<(), CycleError> {
        // Collect affected (partition, key, flattened view) under the lock,
        // evaluate after.
        let mut work: Vec<(u32, UveKey, Value)> = Vec::new();
        {
            let ptab = self.state.ptab_info.lock();
            for (part, tables) in ptab.iter() {
                for (table, names) in tables {
                    for (name, delta) in names {
                        let key_str = format!("{table}:{name}");
                        let applies = changes.contains_key(table) || changes.contains_key(&key_str);
                        if !applies {
                            continue;
                        }
                        let Some(key) = UveKey::parse(&key_str) else {
                            continue;
                        };
                        let mut obj = serde_json::Map::new();
                        for (typ, val) in delta.values() {
                            obj.insert(typ.clone(), flatten(val));
                        }
                        work.push((*part, key, Value::Object(obj)));
                    }
                }
            }
        }
        debug!(keys = work.len(), "re-evaluating alarms after config change");

        let mut rows_by_part: HashMap<u32, Vec<OutputRow>> = HashMap::new();
        for (part, key, local) in work {
            let changed = {
                let registry = self.registry.read();
                let mut alarms = self.state.alarms.lock();
                let mut stats = self.state.stats.lock();
                alarms.examine(part, &key, &local, &registry, &mut stats, now_micros())?
            };
            if changed {
                let row = self.alarm_row(&key);
                rows_by_part.entry(part).or_default().push(row);
            }
        }
        for (part, rows) in rows_by_part {
            let Some(worker) = self.state.worker(part) else {
                continue;
            };
            self.store
                .publish_batch(part, worker.acq_time(), &rows)
                .await
                .context("alarm publish failed")?;
        }
        Ok(())
    }

    /// Scans the timer index and publishes the alarm sets that changed.
    async fn run_alarm_timers(&self) -> Result<(), CycleError> {
        let now = now_micros() / 1_000_000;
        let (deleted, updated) = self.state.alarms.lock().run_timers(now)?;
        let mut affected: BTreeSet<String> = BTreeSet::new();
        for id in deleted.iter().chain(updated.iter()) {
            affected.insert(id.key.clone());
        }
        for key_str in affected {
            let Some(key) = UveKey::parse(&key_str) else {
                continue;
            };
            let part = partition_of(&key_str, self.state.config.partition_count);
            let Some(worker) = self.state.worker(part) else {
                warn!(key = %key_str, partition = part, "timer fired for unowned partition");
                continue;
            };
            let row = self.alarm_row(&key);
            self.store
                .publish_batch(part, worker.acq_time(), &[row])
                .await
                .context("alarm timer publish failed")?;
        }
        Ok(())
    }

    /// Announces the owned-partition map when it changes.
    fn publish_worker_set(&self) {
        let set = self.state.worker_set();
        let mut last = self.last_worker_set.lock();
        if *last != set {
            info!(workers = ?set, "partition ownership map updated");
            metrics::gauge!("alarmflow_owned_partitions").set(set.len() as f64);
            *last = set;
        }
    }
}

fn elapsed_us(t0: Instant) -> i64 {
    i64::try_from(t0.elapsed().as_micros()).unwrap_or(i64::MAX)
}
