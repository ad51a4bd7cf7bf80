//! Type-level delta tracking for a single UVE key.
//!
//! The aggregator keeps one [`TypeDelta`] per (partition, key) holding the
//! last published per-type values. Each update -- either a full snapshot or
//! a single-type change -- classifies every type as added, changed, removed
//! or unchanged, so the publisher can emit exactly the rows that differ and
//! tombstones for the rest.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

/// Tracks the current per-type contents of one UVE and the delta produced by
/// the most recent update.
#[derive(Debug, Default)]
pub struct TypeDelta {
    current: BTreeMap<String, Value>,
    added: BTreeSet<String>,
    removed: BTreeSet<String>,
    changed: BTreeSet<String>,
    unchanged: BTreeSet<String>,
}

impl TypeDelta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole UVE with `new_map`, classifying every type.
    pub fn update_full(&mut self, new_map: BTreeMap<String, Value>) {
        self.added.clear();
        self.removed.clear();
        self.changed.clear();
        self.unchanged.clear();

        for typ in new_map.keys() {
            if !self.current.contains_key(typ) {
                self.added.insert(typ.clone());
            }
        }
        for (typ, old) in &self.current {
            match new_map.get(typ) {
                None => {
                    self.removed.insert(typ.clone());
                }
                Some(new) if new != old => {
                    self.changed.insert(typ.clone());
                }
                Some(_) => {
                    self.unchanged.insert(typ.clone());
                }
            }
        }
        self.current = new_map;
    }

    /// Applies a single-type update. `None` withdraws the type.
    pub fn update_single(&mut self, typ: &str, val: Option<Value>) {
        self.added.clear();
        self.removed.clear();
        self.changed.clear();
        self.unchanged = self.current.keys().cloned().collect();

        match val {
            None => {
                if self.current.remove(typ).is_some() {
                    self.unchanged.remove(typ);
                    self.removed.insert(typ.to_string());
                }
            }
            Some(val) => match self.current.get(typ) {
                Some(old) if *old == val => {}
                Some(_) => {
                    self.unchanged.remove(typ);
                    self.changed.insert(typ.to_string());
                    self.current.insert(typ.to_string(), val);
                }
                None => {
                    self.added.insert(typ.to_string());
                    self.current.insert(typ.to_string(), val);
                }
            },
        }
    }

    /// Current per-type values.
    #[must_use]
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.current
    }

    #[must_use]
    pub fn added(&self) -> &BTreeSet<String> {
        &self.added
    }

    #[must_use]
    pub fn removed(&self) -> &BTreeSet<String> {
        &self.removed
    }

    #[must_use]
    pub fn changed(&self) -> &BTreeSet<String> {
        &self.changed
    }

    #[must_use]
    pub fn unchanged(&self) -> &BTreeSet<String> {
        &self.unchanged
    }

    /// Whether any type survived the last update.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Whether the last update changed anything worth publishing.
    #[must_use]
    pub fn touched(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty())
    }
}
