//! The per-process alarm table: every live alarm state machine, the shared
//! timer index, and the operations the aggregation loop drives them with.

use std::collections::HashMap;

use alarmflow_core::rules::{UveAlarmInfo, UveAlarms};
use alarmflow_core::uve::UveKey;
use serde_json::Value;
use tracing::{debug, info};

use super::processor::{self, RuleRegistry};
use super::state_machine::{AlarmId, AlarmState, AlarmStateMachine, TimerError, TimerIndex};
use crate::stats::ServerStats;

/// Outcome of an acknowledgement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Newly acknowledged; the alarm set must be re-published.
    Acked,
    /// Already acknowledged; idempotent success.
    AlreadyAcked,
    AlarmNotPresent,
    InvalidAlarmRequest,
}

/// Introspection snapshot of one alarm state machine.
pub struct AlarmSnapshot {
    pub key: String,
    pub name: String,
    pub info: Option<UveAlarmInfo>,
    pub params: super::state_machine::SoakParams,
    pub state: AlarmState,
    pub stamps: Vec<i64>,
    pub head: usize,
}

/// All alarm state machines, keyed table -> uve key -> alarm name.
pub struct AlarmTable {
    host_ip: String,
    introspect_port: u16,
    alarms: HashMap<String, HashMap<String, HashMap<String, AlarmStateMachine>>>,
    timers: TimerIndex,
}

impl AlarmTable {
    #[must_use]
    pub fn new(host_ip: impl Into<String>, introspect_port: u16) -> Self {
        Self {
            host_ip: host_ip.into(),
            introspect_port,
            alarms: HashMap::new(),
            timers: TimerIndex::new(),
        }
    }

    /// Re-evaluates the rules for one UVE and runs the resulting
    /// assert/clear transitions. Returns `true` when the published alarm set
    /// for the key changed.
    ///
    /// # Errors
    ///
    /// Timer-index corruption, which the caller escalates to process exit.
    pub fn examine(
        &mut self,
        partition: u32,
        key: &UveKey,
        uve: &Value,
        registry: &RuleRegistry,
        stats: &mut ServerStats,
        now_us: i64,
    ) -> Result<bool, TimerError> {
        let table = key.table().to_string();
        let mut new_alarms = processor::process_alarms(key, uve, registry);

        let mut del_types = Vec::new();
        if let Some(kmap) = self
            .alarms
            .get(&table)
            .and_then(|t| t.get(key.as_str()))
        {
            for (nm, asm) in kmap {
                let same = match new_alarms.get(nm) {
                    None => {
                        del_types.push(nm.clone());
                        false
                    }
                    Some(pa) => asm.is_same_alarm(&pa.info),
                };
                if same {
                    new_alarms.remove(nm);
                }
            }
        }
        if del_types.is_empty() && new_alarms.is_empty() {
            return Ok(false);
        }
        debug!(key = %key, deleted = ?del_types, updated = new_alarms.len(), "alarm delta");

        let now_s = now_us / 1_000_000;
        let kmap = self
            .alarms
            .entry(table.clone())
            .or_default()
            .entry(key.as_str().to_string())
            .or_default();

        for (nm, mut pa) in new_alarms {
            pa.info.timestamp = now_us;
            pa.info.token = processor::token(&self.host_ip, self.introspect_port, now_us);
            let asm = kmap.entry(nm.clone()).or_insert_with(|| {
                AlarmStateMachine::new(
                    AlarmId {
                        table: table.clone(),
                        key: key.as_str().to_string(),
                        name: nm.clone(),
                    },
                    pa.params,
                )
            });
            asm.set_info(pa.info);
            asm.assert_alarm(&mut self.timers, now_s)?;
            stats.count_alarm_set(partition, &table, &nm);
            metrics::counter!("alarmflow_alarms_set_total").increment(1);
        }

        for nm in del_types {
            let Some(asm) = kmap.get_mut(&nm) else {
                continue;
            };
            stats.count_alarm_reset(partition, &table, &nm);
            metrics::counter!("alarmflow_alarms_reset_total").increment(1);
            let delete = asm.clear_alarm(&mut self.timers, now_s)?;
            if delete {
                kmap.remove(&nm);
            }
        }
        self.prune(&table, key.as_str());
        Ok(true)
    }

    /// Clears every alarm for a key (UVE deleted, or it carries nothing but
    /// alarms any more). Returns `true` when alarms existed and the set must
    /// be re-published.
    pub fn clear_key(&mut self, key: &UveKey) -> Result<bool, TimerError> {
        let table = key.table().to_string();
        let Some(kmap) = self
            .alarms
            .get_mut(&table)
            .and_then(|t| t.get_mut(key.as_str()))
        else {
            return Ok(false);
        };
        let now_s = now_seconds();
        let mut gone = Vec::new();
        for (nm, asm) in kmap.iter_mut() {
            if asm.clear_alarm(&mut self.timers, now_s)? {
                gone.push(nm.clone());
            }
        }
        for nm in gone {
            kmap.remove(&nm);
        }
        self.prune(&table, key.as_str());
        Ok(true)
    }

    /// Destroys every alarm for a key without running clear transitions --
    /// partition release and reconnect paths, where the aggregate store
    /// sub-tree is wiped wholesale anyway.
    pub fn drop_key(&mut self, key: &UveKey) {
        let table = key.table();
        if let Some(kmap) = self
            .alarms
            .get_mut(table)
            .and_then(|t| t.get_mut(key.as_str()))
        {
            for asm in kmap.values_mut() {
                asm.delete_timers(&mut self.timers);
            }
            kmap.clear();
        }
        self.prune(table, key.as_str());
    }

    /// Scans the timer index for due entries.
    ///
    /// Returns the alarm ids whose records were destroyed and those whose
    /// set changed; the caller re-publishes each affected key.
    pub fn run_timers(&mut self, now: i64) -> Result<(Vec<AlarmId>, Vec<AlarmId>), TimerError> {
        let mut deleted = Vec::new();
        let mut updated = Vec::new();
        for (_, id) in self.timers.due(now) {
            let Some(asm) = self
                .alarms
                .get_mut(&id.table)
                .and_then(|t| t.get_mut(&id.key))
                .and_then(|k| k.get_mut(&id.name))
            else {
                continue;
            };
            let (delete, update) = asm.run_soak_timer(&mut self.timers, now)?;
            if delete {
                if let Some(kmap) = self
                    .alarms
                    .get_mut(&id.table)
                    .and_then(|t| t.get_mut(&id.key))
                {
                    kmap.remove(&id.name);
                }
                self.prune(&id.table, &id.key);
                deleted.push(id);
            } else if update {
                updated.push(id);
            }
        }
        Ok((deleted, updated))
    }

    /// Acknowledges one alarm instance.
    pub fn ack(&mut self, table: &str, name: &str, alarm_type: &str, timestamp: i64) -> AckOutcome {
        let key = format!("{table}:{name}");
        let Some(asm) = self
            .alarms
            .get_mut(table)
            .and_then(|t| t.get_mut(&key))
            .and_then(|k| k.get_mut(alarm_type))
        else {
            return AckOutcome::AlarmNotPresent;
        };
        // An alarm that is not publishable cannot be acknowledged.
        if asm.info().is_none() {
            return AckOutcome::AlarmNotPresent;
        }
        let Some(info) = asm.info_mut() else {
            return AckOutcome::AlarmNotPresent;
        };
        if info.timestamp != timestamp {
            return AckOutcome::InvalidAlarmRequest;
        }
        if info.ack {
            return AckOutcome::AlreadyAcked;
        }
        info.ack = true;
        info!(table, name, alarm_type, "alarm acknowledged");
        AckOutcome::Acked
    }

    /// The publishable alarm set for one key (Active and Soak_Idle only).
    /// Empty means the `UVEAlarms` struct should be withdrawn.
    #[must_use]
    pub fn active_alarms(&self, key: &UveKey) -> Vec<UveAlarmInfo> {
        self.alarms
            .get(key.table())
            .and_then(|t| t.get(key.as_str()))
            .map(|kmap| kmap.values().filter_map(|asm| asm.info().cloned()).collect())
            .unwrap_or_default()
    }

    /// The `UVEAlarms` payload for a key, or `None` when it must be
    /// withdrawn.
    #[must_use]
    pub fn alarms_payload(&self, key: &UveKey) -> Option<UveAlarms> {
        let alarms = self.active_alarms(key);
        if alarms.is_empty() {
            None
        } else {
            Some(UveAlarms {
                name: key.name().to_string(),
                alarms: Some(alarms),
                deleted: None,
            })
        }
    }

    /// Tables with live alarm records.
    #[must_use]
    pub fn tables(&self) -> Vec<String> {
        let mut out: Vec<String> = self.alarms.keys().cloned().collect();
        out.sort();
        out
    }

    /// Snapshots for introspection.
    #[must_use]
    pub fn snapshots(&self, table: &str) -> Vec<AlarmSnapshot> {
        let Some(tmap) = self.alarms.get(table) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (key, kmap) in tmap {
            for (name, asm) in kmap {
                let (stamps, head) = asm.stamps();
                out.push(AlarmSnapshot {
                    key: key.clone(),
                    name: name.clone(),
                    info: asm.info_forced().cloned(),
                    params: *asm.params(),
                    state: asm.state(),
                    stamps: stamps.to_vec(),
                    head,
                });
            }
        }
        out.sort_by(|a, b| (&a.key, &a.name).cmp(&(&b.key, &b.name)));
        out
    }

    /// Keys with alarm records, per table (active-count stats and partition
    /// withdrawal).
    #[must_use]
    pub fn keys(&self) -> Vec<UveKey> {
        let mut out = Vec::new();
        for tmap in self.alarms.values() {
            for key in tmap.keys() {
                if let Some(k) = UveKey::parse(key) {
                    out.push(k);
                }
            }
        }
        out
    }

    /// Number of timers currently scheduled (invariant checks in tests).
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.timers.pending()
    }

    fn prune(&mut self, table: &str, key: &str) {
        if let Some(tmap) = self.alarms.get_mut(table) {
            if tmap.get(key).is_some_and(HashMap::is_empty) {
                tmap.remove(key);
            }
            if tmap.is_empty() {
                self.alarms.remove(table);
            }
        }
    }
}

fn now_seconds() -> i64 {
    i64::try_from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs()),
    )
    .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::super::processor::ConfiguredRule;
    use super::*;

    fn registry(active_timer: u32, idle_timer: u32) -> RuleRegistry {
        let cfg = serde_json::from_value(json!({
            "name": "vn-down",
            "uve_keys": ["t"],
            "severity": 1,
            "alarm_rules": {"or_list": [{"and_list": [{
                "operation": "==",
                "operand1": "UveX.s",
                "operand2": {"json_value": "\"DOWN\""}
            }]}]},
            "active_timer": active_timer,
            "idle_timer": idle_timer
        }))
        .unwrap();
        let mut reg = RuleRegistry::new();
        reg.register(Arc::new(ConfiguredRule::new(cfg)));
        reg
    }

    fn key() -> UveKey {
        UveKey::parse("t:k1").unwrap()
    }

    #[test]
    fn assert_then_clear_lifecycle() {
        let mut tab = AlarmTable::new("127.0.0.1", 5995);
        let reg = registry(0, 0);
        let mut stats = ServerStats::new();

        let changed = tab
            .examine(0, &key(), &json!({"UveX": {"s": "DOWN"}}), &reg, &mut stats, 1_000_000)
            .unwrap();
        assert!(changed);
        let alarms = tab.active_alarms(&key());
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].alarm_type, "vn-down");
        assert!(alarms[0].timestamp > 0);
        assert!(!alarms[0].token.is_empty());

        let changed = tab
            .examine(0, &key(), &json!({"UveX": {"s": "UP"}}), &reg, &mut stats, 2_000_000)
            .unwrap();
        assert!(changed);
        assert!(tab.active_alarms(&key()).is_empty());
        assert!(tab.alarms_payload(&key()).is_none());
        assert_eq!(tab.pending_timers(), 0);
    }

    #[test]
    fn unchanged_alarm_is_suppressed() {
        let mut tab = AlarmTable::new("127.0.0.1", 5995);
        let reg = registry(0, 0);
        let mut stats = ServerStats::new();
        let uve = json!({"UveX": {"s": "DOWN"}});

        assert!(tab.examine(0, &key(), &uve, &reg, &mut stats, 1_000_000).unwrap());
        let ts = tab.active_alarms(&key())[0].timestamp;

        // Same OR-list: no churn, timestamp stays.
        assert!(!tab.examine(0, &key(), &uve, &reg, &mut stats, 2_000_000).unwrap());
        assert_eq!(tab.active_alarms(&key())[0].timestamp, ts);
    }

    #[test]
    fn soak_active_clear_before_expiry_stays_silent() {
        let mut tab = AlarmTable::new("127.0.0.1", 5995);
        let reg = registry(5, 0);
        let mut stats = ServerStats::new();

        tab.examine(0, &key(), &json!({"UveX": {"s": "DOWN"}}), &reg, &mut stats, 0).unwrap();
        assert!(tab.active_alarms(&key()).is_empty());

        tab.examine(0, &key(), &json!({"UveX": {"s": "UP"}}), &reg, &mut stats, 3_000_000)
            .unwrap();
        assert!(tab.active_alarms(&key()).is_empty());
        // No frequency window: the record is destroyed outright.
        assert!(tab.tables().is_empty());
        assert_eq!(tab.pending_timers(), 0);
    }

    #[test]
    fn soak_timer_expiry_promotes_and_reports() {
        let mut tab = AlarmTable::new("127.0.0.1", 5995);
        let reg = registry(5, 0);
        let mut stats = ServerStats::new();

        tab.examine(0, &key(), &json!({"UveX": {"s": "DOWN"}}), &reg, &mut stats, 0).unwrap();
        let (deleted, updated) = tab.run_timers(5).unwrap();
        assert!(deleted.is_empty());
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].key, "t:k1");
        assert_eq!(tab.active_alarms(&key()).len(), 1);
    }

    #[test]
    fn clear_key_withdraws_everything() {
        let mut tab = AlarmTable::new("127.0.0.1", 5995);
        let reg = registry(0, 0);
        let mut stats = ServerStats::new();
        tab.examine(0, &key(), &json!({"UveX": {"s": "DOWN"}}), &reg, &mut stats, 1_000_000)
            .unwrap();
        assert!(tab.clear_key(&key()).unwrap());
        assert!(tab.active_alarms(&key()).is_empty());
        assert!(!tab.clear_key(&key()).unwrap());
    }

    #[test]
    fn ack_flow_and_error_codes() {
        let mut tab = AlarmTable::new("127.0.0.1", 5995);
        let reg = registry(0, 0);
        let mut stats = ServerStats::new();
        tab.examine(0, &key(), &json!({"UveX": {"s": "DOWN"}}), &reg, &mut stats, 1_000_000)
            .unwrap();
        let ts = tab.active_alarms(&key())[0].timestamp;

        assert_eq!(tab.ack("t", "k1", "no-such", ts), AckOutcome::AlarmNotPresent);
        assert_eq!(
            tab.ack("t", "k1", "vn-down", ts + 1),
            AckOutcome::InvalidAlarmRequest
        );
        assert_eq!(tab.ack("t", "k1", "vn-down", ts), AckOutcome::Acked);
        assert_eq!(tab.ack("t", "k1", "vn-down", ts), AckOutcome::AlreadyAcked);
        assert!(tab.active_alarms(&key())[0].ack);
    }

    #[test]
    fn ack_rejects_soaking_alarm() {
        let mut tab = AlarmTable::new("127.0.0.1", 5995);
        let reg = registry(5, 0);
        let mut stats = ServerStats::new();
        tab.examine(0, &key(), &json!({"UveX": {"s": "DOWN"}}), &reg, &mut stats, 1_000_000)
            .unwrap();
        assert_eq!(tab.ack("t", "k1", "vn-down", 1_000_000), AckOutcome::AlarmNotPresent);
    }

    #[test]
    fn drop_key_cancels_timers_without_publication() {
        let mut tab = AlarmTable::new("127.0.0.1", 5995);
        let reg = registry(5, 0);
        let mut stats = ServerStats::new();
        tab.examine(0, &key(), &json!({"UveX": {"s": "DOWN"}}), &reg, &mut stats, 0).unwrap();
        assert_eq!(tab.pending_timers(), 1);
        tab.drop_key(&key());
        assert_eq!(tab.pending_timers(), 0);
        assert!(tab.tables().is_empty());
    }

    #[test]
    fn snapshots_expose_oper_state() {
        let mut tab = AlarmTable::new("127.0.0.1", 5995);
        let reg = registry(5, 0);
        let mut stats = ServerStats::new();
        tab.examine(0, &key(), &json!({"UveX": {"s": "DOWN"}}), &reg, &mut stats, 0).unwrap();
        let snaps = tab.snapshots("t");
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].state, AlarmState::SoakActive);
        assert_eq!(snaps[0].params.active_timer, 5);
    }
}
