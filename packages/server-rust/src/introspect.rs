//! Transport-agnostic administrative request/response contracts.
//!
//! These handlers read the shared state directly; whatever transport the
//! deployment wires up (HTTP, CLI, tests) serializes the typed responses.

use std::sync::atomic::Ordering;

use alarmflow_core::rules::UveAlarms;
use alarmflow_core::uve::UveKey;
use serde::Serialize;

use crate::alarms::{AckOutcome, AlarmState, RuleRegistry, SoakParams};
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// PartitionStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TypeCountInfo {
    #[serde(rename = "type")]
    pub typ: String,
    pub count: u64,
    pub agg_uuid: String,
}

#[derive(Debug, Serialize)]
pub struct KeyCountInfo {
    pub key: String,
    pub types: Vec<TypeCountInfo>,
}

#[derive(Debug, Serialize)]
pub struct GeneratorCountInfo {
    pub generator: String,
    pub uves: Vec<KeyCountInfo>,
}

#[derive(Debug, Serialize)]
pub struct CollectorCountInfo {
    pub collector: String,
    pub generators: Vec<GeneratorCountInfo>,
}

#[derive(Debug, Serialize)]
pub struct PartitionStatusResp {
    pub partition: u32,
    pub enabled: bool,
    pub offset: i64,
    pub uves: Vec<CollectorCountInfo>,
}

/// Per-partition consumer status; `partition == -1` reports all.
#[must_use]
pub fn partition_status(state: &SharedState, partition: i64) -> Vec<PartitionStatusResp> {
    let workers = state.workers.lock();
    let parts: Vec<u32> = if partition < 0 {
        workers.keys().copied().collect()
    } else {
        vec![u32::try_from(partition).unwrap_or(u32::MAX)]
    };

    parts
        .into_iter()
        .map(|p| match workers.get(&p) {
            None => PartitionStatusResp {
                partition: p,
                enabled: false,
                offset: 0,
                uves: Vec::new(),
            },
            Some(w) => {
                let contents = w.contents.lock();
                let uves = contents
                    .iter()
                    .map(|(collector, gens)| CollectorCountInfo {
                        collector: collector.clone(),
                        generators: gens
                            .iter()
                            .map(|(generator, tables)| GeneratorCountInfo {
                                generator: generator.clone(),
                                uves: tables
                                    .iter()
                                    .flat_map(|(table, names)| {
                                        names.iter().map(move |(name, types)| KeyCountInfo {
                                            key: format!("{table}:{name}"),
                                            types: types
                                                .iter()
                                                .map(|(typ, seen)| TypeCountInfo {
                                                    typ: typ.clone(),
                                                    count: seen.count,
                                                    agg_uuid: seen.agg_uuid.to_string(),
                                                })
                                                .collect(),
                                        })
                                    })
                                    .collect(),
                            })
                            .collect(),
                    })
                    .collect();
                PartitionStatusResp {
                    partition: p,
                    enabled: true,
                    offset: w.health.offset.load(Ordering::SeqCst),
                    uves,
                }
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// UVETableAlarm
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct AlarmStateInfo {
    pub alarms: UveAlarms,
    pub config: SoakParams,
    pub state: AlarmState,
    pub timestamps: Vec<i64>,
    pub head: usize,
}

#[derive(Debug, Serialize)]
pub struct UveTableAlarmResp {
    pub table: String,
    pub uves: Vec<AlarmStateInfo>,
}

/// Alarm records per table; `table == "all"` reports every table.
#[must_use]
pub fn uve_table_alarm(state: &SharedState, table: &str) -> Vec<UveTableAlarmResp> {
    let alarms = state.alarms.lock();
    let tables = if table == "all" {
        alarms.tables()
    } else {
        vec![table.to_string()]
    };
    tables
        .into_iter()
        .map(|t| {
            let uves = alarms
                .snapshots(&t)
                .into_iter()
                .map(|snap| {
                    let name = UveKey::parse(&snap.key)
                        .map_or_else(|| snap.key.clone(), |k| k.name().to_string());
                    AlarmStateInfo {
                        alarms: UveAlarms {
                            name,
                            alarms: snap.info.map(|i| vec![i]),
                            deleted: None,
                        },
                        config: snap.params,
                        state: snap.state,
                        timestamps: snap.stamps,
                        head: snap.head,
                    }
                })
                .collect();
            UveTableAlarmResp { table: t, uves }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// UVETableInfo
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StructContentInfo {
    #[serde(rename = "type")]
    pub typ: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct UveObjectInfo {
    pub name: String,
    pub structs: Vec<StructContentInfo>,
}

#[derive(Debug, Serialize)]
pub struct UveTableContents {
    pub table: String,
    pub uves: Vec<UveObjectInfo>,
}

#[derive(Debug, Serialize)]
pub struct UveTableInfoResp {
    pub partition: u32,
    pub tables: Vec<UveTableContents>,
}

/// The aggregator's current view of one partition.
#[must_use]
pub fn uve_table_info(state: &SharedState, partition: u32) -> UveTableInfoResp {
    let ptab = state.ptab_info.lock();
    let tables = ptab
        .get(&partition)
        .map(|tables| {
            let mut out: Vec<UveTableContents> = tables
                .iter()
                .map(|(table, names)| {
                    let mut uves: Vec<UveObjectInfo> = names
                        .iter()
                        .map(|(name, delta)| UveObjectInfo {
                            name: name.clone(),
                            structs: delta
                                .values()
                                .iter()
                                .map(|(typ, val)| StructContentInfo {
                                    typ: typ.clone(),
                                    content: val.to_string(),
                                })
                                .collect(),
                        })
                        .collect();
                    uves.sort_by(|a, b| a.name.cmp(&b.name));
                    UveTableContents {
                        table: table.clone(),
                        uves,
                    }
                })
                .collect();
            out.sort_by(|a, b| a.table.cmp(&b.table));
            out
        })
        .unwrap_or_default();
    UveTableInfoResp { partition, tables }
}

// ---------------------------------------------------------------------------
// UVETablePerf
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct UveTablePerfResp {
    pub table: String,
    pub call_time: i64,
    pub get_time: i64,
    pub pub_time: i64,
    pub updates: u64,
}

/// Moving averages of the last stats period; `table == "all"` reports every
/// table.
#[must_use]
pub fn uve_table_perf(state: &SharedState, table: &str) -> Vec<UveTablePerfResp> {
    let stats = state.stats.lock();
    let mut out: Vec<UveTablePerfResp> = stats
        .perf_prev()
        .iter()
        .filter(|(t, _)| table == "all" || *t == table)
        .map(|(t, p)| UveTablePerfResp {
            table: t.clone(),
            call_time: p.call_result(),
            get_time: p.get_result(),
            pub_time: p.pub_result(),
            updates: p.updates(),
        })
        .collect();
    out.sort_by(|a, b| a.table.cmp(&b.table));
    out
}

// ---------------------------------------------------------------------------
// AlarmConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct AlarmConfigResp {
    pub alarms: Vec<serde_json::Value>,
}

/// Serialized alarm configurations, optionally filtered by fq-name.
#[must_use]
pub fn alarm_configs(registry: &RuleRegistry, name: Option<&str>) -> AlarmConfigResp {
    let alarms = registry
        .all()
        .into_iter()
        .filter(|(n, _)| name.is_none_or(|want| n == want))
        .filter_map(|(_, rule)| serde_json::to_value(rule.config()).ok())
        .collect();
    AlarmConfigResp { alarms }
}

// ---------------------------------------------------------------------------
// AlarmAck
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmAckRequest {
    pub table: String,
    pub name: String,
    pub alarm_type: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlarmAckResponse {
    Success,
    AlarmNotPresent,
    InvalidAlarmRequest,
}

/// Acknowledges an alarm. The boolean asks the caller to re-publish the
/// key's alarm set (first ack only).
#[must_use]
pub fn alarm_ack(state: &SharedState, req: &AlarmAckRequest) -> (AlarmAckResponse, bool) {
    let outcome =
        state
            .alarms
            .lock()
            .ack(&req.table, &req.name, &req.alarm_type, req.timestamp);
    match outcome {
        AckOutcome::Acked => (AlarmAckResponse::Success, true),
        AckOutcome::AlreadyAcked => (AlarmAckResponse::Success, false),
        AckOutcome::AlarmNotPresent => (AlarmAckResponse::AlarmNotPresent, false),
        AckOutcome::InvalidAlarmRequest => (AlarmAckResponse::InvalidAlarmRequest, false),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::alarms::ConfiguredRule;
    use crate::config::Config;
    use crate::stats::ServerStats;

    fn state() -> SharedState {
        SharedState::new(Arc::new(Config::default()))
    }

    #[test]
    fn partition_status_reports_disabled_partitions() {
        let s = state();
        let resp = partition_status(&s, 5);
        assert_eq!(resp.len(), 1);
        assert!(!resp[0].enabled);
    }

    #[test]
    fn table_alarm_snapshot_includes_oper_state() {
        let s = state();
        let cfg = serde_json::from_value(json!({
            "name": "vn-down", "uve_keys": ["t"], "severity": 1,
            "alarm_rules": {"or_list": [{"and_list": [{
                "operation": "==", "operand1": "UveX.s",
                "operand2": {"json_value": "\"DOWN\""}}]}]}
        }))
        .unwrap();
        let mut reg = RuleRegistry::new();
        reg.register(Arc::new(ConfiguredRule::new(cfg)));
        let key = UveKey::parse("t:k1").unwrap();
        {
            let mut alarms = s.alarms.lock();
            let mut stats = ServerStats::new();
            alarms
                .examine(0, &key, &json!({"UveX": {"s": "DOWN"}}), &reg, &mut stats, 1_000_000)
                .unwrap();
        }

        let resp = uve_table_alarm(&s, "all");
        assert_eq!(resp.len(), 1);
        assert_eq!(resp[0].table, "t");
        assert_eq!(resp[0].uves[0].state, AlarmState::Active);
        assert_eq!(resp[0].uves[0].alarms.name, "k1");
    }

    #[test]
    fn perf_report_covers_last_period() {
        let s = state();
        s.stats.lock().perf("t").record_get(42);
        let _ = s.stats.lock().collect();
        let resp = uve_table_perf(&s, "all");
        assert_eq!(resp.len(), 1);
        assert_eq!(resp[0].get_time, 42);
    }

    #[test]
    fn alarm_config_filter_by_name() {
        let mut reg = RuleRegistry::new();
        for name in ["a1", "a2"] {
            let cfg = serde_json::from_value(json!({
                "name": name, "uve_keys": ["t"], "severity": 1,
                "alarm_rules": {"or_list": []}
            }))
            .unwrap();
            reg.register(Arc::new(ConfiguredRule::new(cfg)));
        }
        assert_eq!(alarm_configs(&reg, None).alarms.len(), 2);
        let one = alarm_configs(&reg, Some("a2"));
        assert_eq!(one.alarms.len(), 1);
        assert_eq!(one.alarms[0]["name"], json!("a2"));
    }

    #[test]
    fn ack_maps_outcomes() {
        let s = state();
        let req = AlarmAckRequest {
            table: "t".to_string(),
            name: "k1".to_string(),
            alarm_type: "vn-down".to_string(),
            timestamp: 1,
        };
        assert_eq!(
            alarm_ack(&s, &req),
            (AlarmAckResponse::AlarmNotPresent, false)
        );
    }
}
