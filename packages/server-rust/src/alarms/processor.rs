//! Rule selection and per-UVE alarm evaluation.
//!
//! Rules register under each scope named in their `uve_keys` -- a bare table
//! name or a full `table:name` key. [`process_alarms`] runs every applicable
//! rule against one flattened UVE and returns the alarms that should exist
//! for it, each with the soak parameters its state machine will be created
//! with.
//!
//! A rule may be backed by plain configuration ([`ConfiguredRule`]) or by an
//! imperative capability object registered at startup; the latter's OR-list
//! replaces generic evaluation but is opaque here.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use alarmflow_core::eval::{self, EvalError};
use alarmflow_core::rules::{AlarmAndList, AlarmConfig, UveAlarmInfo};
use alarmflow_core::uve::UveKey;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tracing::error;

use super::state_machine::SoakParams;

/// One evaluatable alarm rule.
pub trait AlarmRule: Send + Sync {
    fn config(&self) -> &AlarmConfig;

    /// Returns the satisfied OR-list, or `None` when the alarm should not
    /// exist for this UVE.
    ///
    /// # Errors
    ///
    /// Evaluation failures still produce an alarm slot with `rules = None`.
    fn evaluate(&self, key: &UveKey, uve: &Value) -> Result<Option<Vec<AlarmAndList>>, EvalError>;
}

/// Rule driven entirely by its configured rule tree.
pub struct ConfiguredRule {
    cfg: AlarmConfig,
}

impl ConfiguredRule {
    #[must_use]
    pub fn new(cfg: AlarmConfig) -> Self {
        Self { cfg }
    }
}

impl AlarmRule for ConfiguredRule {
    fn config(&self) -> &AlarmConfig {
        &self.cfg
    }

    fn evaluate(&self, key: &UveKey, uve: &Value) -> Result<Option<Vec<AlarmAndList>>, EvalError> {
        eval::evaluate(&self.cfg, key, uve)
    }
}

// ---------------------------------------------------------------------------
// RuleRegistry
// ---------------------------------------------------------------------------

/// Rules indexed by scope (table or full key), then by fq-name.
#[derive(Default)]
pub struct RuleRegistry {
    scopes: HashMap<String, BTreeMap<String, Arc<dyn AlarmRule>>>,
}

impl RuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a rule under every scope its config names. A rule with the
    /// same fq-name replaces its previous registration everywhere.
    pub fn register(&mut self, rule: Arc<dyn AlarmRule>) {
        let name = rule.config().name.clone();
        self.remove(&name);
        for scope in &rule.config().uve_keys {
            self.scopes
                .entry(scope.clone())
                .or_default()
                .insert(name.clone(), Arc::clone(&rule));
        }
    }

    /// Removes a rule by fq-name from every scope.
    pub fn remove(&mut self, fqname: &str) {
        self.scopes.retain(|_, rules| {
            rules.remove(fqname);
            !rules.is_empty()
        });
    }

    /// Rules applicable to a key: those scoped to its table plus those
    /// scoped to the full key.
    #[must_use]
    pub fn rules_for(&self, key: &UveKey) -> BTreeMap<String, Arc<dyn AlarmRule>> {
        let mut out = BTreeMap::new();
        for scope in [key.table(), key.as_str()] {
            if let Some(rules) = self.scopes.get(scope) {
                for (name, rule) in rules {
                    out.insert(name.clone(), Arc::clone(rule));
                }
            }
        }
        out
    }

    /// Looks a rule up by fq-name.
    #[must_use]
    pub fn get(&self, fqname: &str) -> Option<Arc<dyn AlarmRule>> {
        self.scopes
            .values()
            .find_map(|rules| rules.get(fqname).cloned())
    }

    /// Every registered rule, deduplicated by fq-name.
    #[must_use]
    pub fn all(&self) -> BTreeMap<String, Arc<dyn AlarmRule>> {
        let mut out = BTreeMap::new();
        for rules in self.scopes.values() {
            for (name, rule) in rules {
                out.entry(name.clone()).or_insert_with(|| Arc::clone(rule));
            }
        }
        out
    }

    /// Registered scopes (tables and full keys).
    #[must_use]
    pub fn scopes(&self) -> Vec<String> {
        self.scopes.keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

/// An alarm that should exist after evaluating one UVE.
pub struct ProcessedAlarm {
    pub info: UveAlarmInfo,
    pub params: SoakParams,
}

/// Evaluates every applicable rule against one flattened UVE.
///
/// The produced infos carry `timestamp == 0` and an empty token; the alarm
/// table stamps both when it decides the alarm is new or updated.
#[must_use]
pub fn process_alarms(
    key: &UveKey,
    uve: &Value,
    registry: &RuleRegistry,
) -> HashMap<String, ProcessedAlarm> {
    let mut out = HashMap::new();
    for (fqname, rule) in registry.rules_for(key) {
        let cfg = rule.config();
        if !cfg.enabled {
            continue;
        }
        let rules = match rule.evaluate(key, uve) {
            Ok(None) => continue,
            Ok(Some(or_list)) => Some(or_list),
            Err(e) => {
                error!(key = %key, alarm = %fqname, error = %e, "alarm rule evaluation failed");
                None
            }
        };
        out.insert(
            fqname.clone(),
            ProcessedAlarm {
                info: UveAlarmInfo {
                    alarm_type: fqname,
                    severity: cfg.severity,
                    timestamp: 0,
                    token: String::new(),
                    rules,
                    description: cfg.description.clone(),
                    ack: false,
                },
                params: SoakParams::from(cfg),
            },
        );
    }
    out
}

/// Opaque acknowledgement token: base64 of the host, introspect port and
/// alarm timestamp.
#[must_use]
pub fn token(host_ip: &str, introspect_port: u16, timestamp: i64) -> String {
    let doc = json!({
        "host_ip": host_ip,
        "http_port": introspect_port,
        "timestamp": timestamp,
    });
    BASE64.encode(doc.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn rule(name: &str, scopes: &[&str], operand1: &str, literal: &str) -> Arc<dyn AlarmRule> {
        let cfg: AlarmConfig = serde_json::from_value(json!({
            "name": name,
            "uve_keys": scopes,
            "severity": 2,
            "description": "state is bad",
            "alarm_rules": {"or_list": [{"and_list": [{
                "operation": "==",
                "operand1": operand1,
                "operand2": {"json_value": literal}
            }]}]}
        }))
        .unwrap();
        Arc::new(ConfiguredRule::new(cfg))
    }

    fn key() -> UveKey {
        UveKey::parse("t:k1").unwrap()
    }

    #[test]
    fn rules_select_by_table_and_full_key() {
        let mut reg = RuleRegistry::new();
        reg.register(rule("by-table", &["t"], "UveX.s", "\"DOWN\""));
        reg.register(rule("by-key", &["t:k1"], "UveX.s", "\"DOWN\""));
        reg.register(rule("other", &["u"], "UveX.s", "\"DOWN\""));

        let selected = reg.rules_for(&key());
        assert_eq!(
            selected.keys().cloned().collect::<Vec<_>>(),
            vec!["by-key".to_string(), "by-table".to_string()]
        );
    }

    #[test]
    fn reregistration_replaces_everywhere() {
        let mut reg = RuleRegistry::new();
        reg.register(rule("a", &["t", "u"], "UveX.s", "\"DOWN\""));
        reg.register(rule("a", &["t"], "UveX.s", "\"UP\""));
        assert_eq!(reg.all().len(), 1);
        assert_eq!(reg.scopes().len(), 1);
    }

    #[test]
    fn remove_drops_empty_scopes() {
        let mut reg = RuleRegistry::new();
        reg.register(rule("a", &["t"], "UveX.s", "\"DOWN\""));
        reg.remove("a");
        assert!(reg.scopes().is_empty());
        assert!(reg.get("a").is_none());
    }

    #[test]
    fn process_emits_firing_alarms_only() {
        let mut reg = RuleRegistry::new();
        reg.register(rule("fires", &["t"], "UveX.s", "\"DOWN\""));
        reg.register(rule("quiet", &["t"], "UveX.s", "\"UP\""));

        let uve = json!({"UveX": {"s": "DOWN"}});
        let out = process_alarms(&key(), &uve, &reg);
        assert_eq!(out.len(), 1);
        let alarm = &out["fires"];
        assert_eq!(alarm.info.severity, 2);
        assert!(alarm.info.rules.is_some());
        assert!(!alarm.info.ack);
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut reg = RuleRegistry::new();
        let mut cfg: AlarmConfig = serde_json::from_value(json!({
            "name": "off", "uve_keys": ["t"], "severity": 1,
            "alarm_rules": {"or_list": [{"and_list": [{
                "operation": "==", "operand1": "UveX.s",
                "operand2": {"json_value": "\"DOWN\""}}]}]},
            "enabled": false
        }))
        .unwrap();
        cfg.enabled = false;
        reg.register(Arc::new(ConfiguredRule::new(cfg)));
        let out = process_alarms(&key(), &json!({"UveX": {"s": "DOWN"}}), &reg);
        assert!(out.is_empty());
    }

    #[test]
    fn evaluation_error_yields_null_rules_slot() {
        let mut reg = RuleRegistry::new();
        reg.register(rule("broken", &["t"], "UveX.s", "{not json"));
        let out = process_alarms(&key(), &json!({"UveX": {"s": "DOWN"}}), &reg);
        assert!(out["broken"].info.rules.is_none());
    }

    #[test]
    fn custom_rule_output_replaces_generic_evaluation() {
        struct AlwaysFiring {
            cfg: AlarmConfig,
        }
        impl AlarmRule for AlwaysFiring {
            fn config(&self) -> &AlarmConfig {
                &self.cfg
            }
            fn evaluate(
                &self,
                _key: &UveKey,
                _uve: &Value,
            ) -> Result<Option<Vec<AlarmAndList>>, EvalError> {
                Ok(Some(vec![AlarmAndList { and_list: vec![] }]))
            }
        }
        let cfg: AlarmConfig = serde_json::from_value(json!({
            "name": "custom", "uve_keys": ["t"], "severity": 0,
            "alarm_rules": {"or_list": []}
        }))
        .unwrap();
        let mut reg = RuleRegistry::new();
        reg.register(Arc::new(AlwaysFiring { cfg }));
        let out = process_alarms(&key(), &json!({}), &reg);
        assert!(out.contains_key("custom"));
    }

    #[test]
    fn token_decodes_to_host_and_timestamp() {
        let tok = token("10.0.0.1", 5995, 123_456);
        let decoded = BASE64.decode(tok).unwrap();
        let doc: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(doc["host_ip"], json!("10.0.0.1"));
        assert_eq!(doc["timestamp"], json!(123_456));
    }
}
