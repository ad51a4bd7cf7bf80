//! UVE server seam: where aggregation fetches per-source contributions.
//!
//! The bus only notifies *which* `(key, type)` changed; the current value of
//! each contribution lives on the collector-fronted UVE servers. The
//! aggregator reads them through [`UveReader`], restricted to the changed
//! types. The same seam exposes the live collector set and, for a collector
//! that just appeared, the population of keys it holds for a partition --
//! the partition consumers resync against both.
//!
//! [`MemoryUveReader`] backs tests and single-process runs.

use std::collections::{BTreeMap, BTreeSet};

use alarmflow_core::aggregate::SourceContribs;
use alarmflow_core::partition::partition_of;
use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::Mutex;
use serde_json::Value;

/// Per-generator key/type population a collector holds for one partition.
pub type CollectorPopulation = BTreeMap<String, BTreeMap<String, BTreeSet<String>>>;

/// Read access to the current UVE contributions.
#[async_trait]
pub trait UveReader: Send + Sync {
    /// Fetches contributions for `key`, restricted to `types` when given.
    ///
    /// The boolean is `true` when some sources could not be read; partial
    /// results are still returned and the caller requeues the key.
    async fn read_uve(&self, key: &str, types: Option<&BTreeSet<String>>)
        -> (bool, SourceContribs);

    /// The collectors currently alive.
    fn collectors(&self) -> BTreeSet<String>;

    /// The keys (and their types) `collector` contributes to `partition`.
    async fn collector_population(
        &self,
        collector: &str,
        partition: u32,
        partition_count: u32,
    ) -> CollectorPopulation;
}

// ---------------------------------------------------------------------------
// MemoryUveReader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Contribution {
    collector: String,
    value: Value,
}

/// In-memory [`UveReader`].
///
/// Tests drive it alongside the memory bus: publishing a bus notification
/// and setting the matching contribution here mirrors what a generator does
/// through a collector.
#[derive(Default)]
pub struct MemoryUveReader {
    // key -> type -> generator -> contribution
    data: Mutex<BTreeMap<String, BTreeMap<String, BTreeMap<String, Contribution>>>>,
    collectors: Mutex<BTreeSet<String>>,
    fail_keys: DashSet<String>,
}

impl MemoryUveReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a collector alive.
    pub fn add_collector(&self, collector: &str) {
        self.collectors.lock().insert(collector.to_string());
    }

    /// Marks a collector gone and drops everything it contributed.
    pub fn remove_collector(&self, collector: &str) {
        self.collectors.lock().remove(collector);
        let mut data = self.data.lock();
        for types in data.values_mut() {
            for gens in types.values_mut() {
                gens.retain(|_, c| c.collector != collector);
            }
            types.retain(|_, gens| !gens.is_empty());
        }
        data.retain(|_, types| !types.is_empty());
    }

    /// Sets one contribution.
    pub fn set(&self, collector: &str, generator: &str, key: &str, typ: &str, value: Value) {
        self.data
            .lock()
            .entry(key.to_string())
            .or_default()
            .entry(typ.to_string())
            .or_default()
            .insert(
                generator.to_string(),
                Contribution {
                    collector: collector.to_string(),
                    value,
                },
            );
    }

    /// Withdraws one contribution.
    pub fn withdraw(&self, generator: &str, key: &str, typ: &str) {
        let mut data = self.data.lock();
        if let Some(types) = data.get_mut(key) {
            if let Some(gens) = types.get_mut(typ) {
                gens.remove(generator);
                if gens.is_empty() {
                    types.remove(typ);
                }
            }
            if types.is_empty() {
                data.remove(key);
            }
        }
    }

    /// Makes reads of `key` report a partial failure.
    pub fn set_failing(&self, key: &str, failing: bool) {
        if failing {
            self.fail_keys.insert(key.to_string());
        } else {
            self.fail_keys.remove(key);
        }
    }
}

#[async_trait]
impl UveReader for MemoryUveReader {
    async fn read_uve(
        &self,
        key: &str,
        types: Option<&BTreeSet<String>>,
    ) -> (bool, SourceContribs) {
        let failed = self.fail_keys.contains(key);
        let live = self.collectors.lock().clone();
        let mut out = SourceContribs::new();
        if let Some(entry) = self.data.lock().get(key) {
            for (typ, gens) in entry {
                if types.is_some_and(|t| !t.contains(typ)) {
                    continue;
                }
                for (generator, contrib) in gens {
                    if !live.contains(&contrib.collector) {
                        continue;
                    }
                    out.entry(typ.clone())
                        .or_default()
                        .insert(generator.clone(), contrib.value.clone());
                }
            }
        }
        (failed, out)
    }

    fn collectors(&self) -> BTreeSet<String> {
        self.collectors.lock().clone()
    }

    async fn collector_population(
        &self,
        collector: &str,
        partition: u32,
        partition_count: u32,
    ) -> CollectorPopulation {
        let mut out = CollectorPopulation::new();
        for (key, types) in self.data.lock().iter() {
            if partition_of(key, partition_count) != partition {
                continue;
            }
            for (typ, gens) in types {
                for (generator, contrib) in gens {
                    if contrib.collector != collector {
                        continue;
                    }
                    out.entry(generator.clone())
                        .or_default()
                        .entry(key.clone())
                        .or_default()
                        .insert(typ.clone());
                }
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const COLL: &str = "coll-1:6379";
    const GEN: &str = "host1:vrouter:agent:0";

    #[tokio::test]
    async fn read_restricts_to_requested_types() {
        let r = MemoryUveReader::new();
        r.add_collector(COLL);
        r.set(COLL, GEN, "t:k1", "UveA", json!({"a": 1}));
        r.set(COLL, GEN, "t:k1", "UveB", json!({"b": 2}));

        let filter: BTreeSet<String> = ["UveA".to_string()].into();
        let (failed, contribs) = r.read_uve("t:k1", Some(&filter)).await;
        assert!(!failed);
        assert_eq!(contribs.len(), 1);
        assert!(contribs.contains_key("UveA"));

        let (_, all) = r.read_uve("t:k1", None).await;
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn dead_collector_contributions_are_invisible() {
        let r = MemoryUveReader::new();
        r.add_collector(COLL);
        r.set(COLL, GEN, "t:k1", "UveA", json!({"a": 1}));
        r.remove_collector(COLL);
        let (_, contribs) = r.read_uve("t:k1", None).await;
        assert!(contribs.is_empty());
    }

    #[tokio::test]
    async fn withdraw_drops_empty_levels() {
        let r = MemoryUveReader::new();
        r.add_collector(COLL);
        r.set(COLL, GEN, "t:k1", "UveA", json!({"a": 1}));
        r.withdraw(GEN, "t:k1", "UveA");
        let (_, contribs) = r.read_uve("t:k1", None).await;
        assert!(contribs.is_empty());
    }

    #[tokio::test]
    async fn population_is_partition_scoped() {
        let r = MemoryUveReader::new();
        r.add_collector(COLL);
        let key = "t:k1";
        let part = partition_of(key, 4);
        r.set(COLL, GEN, key, "UveA", json!({"a": 1}));

        let pop = r.collector_population(COLL, part, 4).await;
        assert!(pop[GEN][key].contains("UveA"));
        let other = r.collector_population(COLL, (part + 1) % 4, 4).await;
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn failing_key_reports_partial_failure() {
        let r = MemoryUveReader::new();
        r.set_failing("t:k1", true);
        let (failed, _) = r.read_uve("t:k1", None).await;
        assert!(failed);
    }
}
