//! Alarm configuration feed.
//!
//! Consumes `{table -> {alarm_fqname -> config | delete}}` deltas from the
//! rule source, applies them to the rule registry, and coalesces a change
//! map that the aggregation loop uses to re-evaluate affected keys on its
//! next cycle. A delta that fails to parse is logged and skipped; the
//! previous configuration stays in force.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use alarmflow_core::rules::AlarmConfig;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::alarms::{ConfiguredRule, RuleRegistry};

/// One batch of alarm-config changes: scope (usually a table) -> fq-name ->
/// new config document, or `None` to delete the alarm.
#[derive(Debug, Default)]
pub struct ConfigUpdate {
    pub alarms: HashMap<String, HashMap<String, Option<serde_json::Value>>>,
}

pub struct ConfigFeed {
    registry: Arc<RwLock<RuleRegistry>>,
    changes: Arc<Mutex<HashMap<String, HashSet<String>>>>,
    rx: mpsc::Receiver<ConfigUpdate>,
}

impl ConfigFeed {
    #[must_use]
    pub fn new(
        registry: Arc<RwLock<RuleRegistry>>,
        changes: Arc<Mutex<HashMap<String, HashSet<String>>>>,
        rx: mpsc::Receiver<ConfigUpdate>,
    ) -> Self {
        Self {
            registry,
            changes,
            rx,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                update = self.rx.recv() => match update {
                    Some(update) => self.apply(update),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("config feed stopped");
    }

    /// Applies one delta batch to the registry and the coalesced change map.
    pub fn apply(&self, update: ConfigUpdate) {
        for (table, alarms) in update.alarms {
            for (fqname, doc) in alarms {
                match doc {
                    None => {
                        info!(table, alarm = %fqname, "alarm config removed");
                        self.registry.write().remove(&fqname);
                        self.note_change(&table, &fqname);
                    }
                    Some(doc) => match serde_json::from_value::<AlarmConfig>(doc) {
                        Ok(mut cfg) => {
                            if cfg.uve_keys.is_empty() {
                                cfg.uve_keys = vec![table.clone()];
                            }
                            info!(table, alarm = %fqname, scopes = ?cfg.uve_keys, "alarm config updated");
                            for scope in cfg.uve_keys.clone() {
                                self.note_change(&scope, &fqname);
                            }
                            self.note_change(&table, &fqname);
                            self.registry.write().register(Arc::new(ConfiguredRule::new(cfg)));
                        }
                        Err(e) => {
                            error!(table, alarm = %fqname, error = %e,
                                "alarm config parse failed; keeping previous config");
                        }
                    },
                }
            }
        }
    }

    fn note_change(&self, scope: &str, fqname: &str) {
        self.changes
            .lock()
            .entry(scope.to_string())
            .or_default()
            .insert(fqname.to_string());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
